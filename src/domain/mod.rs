pub mod clock;
pub mod pair;
pub mod snapshot;
pub mod tier;

pub use clock::*;
pub use pair::*;
pub use snapshot::*;
pub use tier::*;
