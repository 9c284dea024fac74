//! Concrete collaborators wired up by the binary

pub mod http_fetcher;
pub mod log_sink;

pub use http_fetcher::HttpPairFetcher;
pub use log_sink::LoggingSink;
