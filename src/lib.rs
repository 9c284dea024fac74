pub mod adapters;
pub mod app;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod logging;

pub use app::PairScanner;
pub use config::AppConfig;
pub use domain::{
    CachedSnapshot, ChatId, ChatProfile, Clock, FetchResult, PairMetadata, Payload, PollingTier,
    SnapshotStatus, SystemClock, TierCadences, TokioClock,
};
pub use error::{Result, ScanError};
pub use infra::{
    HostResolver, PairFetcher, PairState, PollStatus, RateLimiterConfig, RequestRateLimiter,
    Scheduler, SchedulerConfig, SnapshotSink, StateStore, SwrCache, TokenBucket,
};
