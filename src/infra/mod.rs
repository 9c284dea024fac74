//! Polling core: rate limiting, state, caching and scheduling

pub mod ratelimit;
pub mod scheduler;
pub mod store;
pub mod swr;

pub use ratelimit::{RateLimiterConfig, RequestRateLimiter, TokenBucket};
pub use scheduler::{
    HostResolver, PairFetcher, PairState, PollStatus, Scheduler, SchedulerConfig, SnapshotSink,
};
pub use store::{StateStore, UserSubscriptions};
pub use swr::SwrCache;
