//! Hierarchical token-bucket rate limiting.
//!
//! One global bucket caps total upstream traffic; optional per-host buckets
//! enforce each provider's own, usually tighter, ceiling. Refill is computed
//! lazily on every acquire attempt, never by a background timer.

use crate::error::{Result, ScanError};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default burst headroom on top of the per-minute rate (20%)
pub const DEFAULT_BURST_RATIO: f64 = 0.2;

/// Default randomisation applied to computed waits (±10%)
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Refillable token balance; callers await availability
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_second: f64,
    capacity: f64,
    jitter_ratio: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate_per_second: f64, capacity: f64, jitter_ratio: f64) -> Result<Self> {
        if !(rate_per_second > 0.0) {
            return Err(ScanError::InvalidConfig(
                "rate_per_second must be positive".to_string(),
            ));
        }
        if !(capacity > 0.0) {
            return Err(ScanError::InvalidConfig(
                "capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            rate_per_second,
            capacity,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Bucket sized from a per-minute rate plus burst headroom
    pub fn per_minute(rate_per_min: u32, burst_ratio: f64, jitter_ratio: f64) -> Result<Self> {
        let rate = rate_per_min as f64;
        Self::new(rate / 60.0, rate * (1.0 + burst_ratio.max(0.0)), jitter_ratio)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    /// Current balance after applying any pending refill
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    /// Acquire `tokens`, waiting for refill if necessary.
    ///
    /// Returns the total time spent waiting. Fails with
    /// `RateLimitExceeded` when the next wait would overrun `timeout`, or
    /// immediately when `tokens` exceeds the capacity and could never be met.
    /// The lock is only held for the balance check, never across a sleep.
    pub async fn acquire(&self, tokens: f64, timeout: Option<Duration>) -> Result<Duration> {
        if tokens > self.capacity {
            return Err(ScanError::RateLimitExceeded(format!(
                "{} token(s) requested but bucket capacity is {:.1}",
                tokens, self.capacity
            )));
        }
        let start = Instant::now();
        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= tokens {
                    state.tokens -= tokens;
                    return Ok(waited);
                }
                let deficit = tokens - state.tokens;
                let base = deficit / self.rate_per_second;
                let jitter = if self.jitter_ratio > 0.0 {
                    rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio)
                } else {
                    0.0
                };
                Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
            };

            if let Some(limit) = timeout {
                if start.elapsed() + wait > limit {
                    return Err(ScanError::RateLimitExceeded(format!(
                        "token bucket could not supply {} token(s) within {:?}",
                        tokens, limit
                    )));
                }
            }

            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
            waited += wait;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(self.capacity);
        state.last_refill = now;
    }
}

/// Configuration for the request rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub global_rate_per_min: u32,
    pub burst_ratio: f64,
    pub jitter_ratio: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_rate_per_min: 120,
            burst_ratio: DEFAULT_BURST_RATIO,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

/// Global bucket plus a dynamically registrable map of per-host buckets
pub struct RequestRateLimiter {
    config: RateLimiterConfig,
    global: TokenBucket,
    hosts: DashMap<String, Arc<TokenBucket>>,
}

impl RequestRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        if config.global_rate_per_min == 0 {
            return Err(ScanError::InvalidConfig(
                "global_rate_per_min must be positive".to_string(),
            ));
        }
        let global = TokenBucket::per_minute(
            config.global_rate_per_min,
            config.burst_ratio,
            config.jitter_ratio,
        )?;
        info!(
            "Rate limiter initialised: {} req/min global (capacity {:.1})",
            config.global_rate_per_min,
            global.capacity()
        );
        Ok(Self {
            config,
            global,
            hosts: DashMap::new(),
        })
    }

    /// Build a limiter with an initial set of host ceilings
    pub fn with_hosts<I, S>(config: RateLimiterConfig, hosts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let limiter = Self::new(config)?;
        for (host, rate) in hosts {
            limiter.register_host(host, rate)?;
        }
        Ok(limiter)
    }

    /// Register (or replace) a per-host bucket
    pub fn register_host(&self, host: impl Into<String>, rate_per_min: u32) -> Result<()> {
        let host = host.into();
        let bucket = TokenBucket::per_minute(
            rate_per_min,
            self.config.burst_ratio,
            self.config.jitter_ratio,
        )?;
        debug!("Registered host bucket '{}' at {} req/min", host, rate_per_min);
        self.hosts.insert(host, Arc::new(bucket));
        Ok(())
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains_key(host)
    }

    /// Debit the global bucket and, for a known host, its bucket too.
    ///
    /// Returns the summed wait. Unknown hosts only pay the global cost.
    /// `timeout` bounds the whole call: the host bucket only gets what the
    /// global wait left over.
    pub async fn acquire(
        &self,
        host: Option<&str>,
        tokens: f64,
        timeout: Option<Duration>,
    ) -> Result<Duration> {
        let start = Instant::now();
        let mut waited = self.global.acquire(tokens, timeout).await?;

        // Clone the Arc out so no map shard lock is held across the await
        let host_bucket = host.and_then(|h| self.hosts.get(h).map(|b| Arc::clone(b.value())));
        if let Some(bucket) = host_bucket {
            let remaining = timeout.map(|limit| limit.saturating_sub(start.elapsed()));
            waited += bucket.acquire(tokens, remaining).await?;
        }

        if !waited.is_zero() {
            debug!("Rate limiter delayed request for {:?} by {:?}", host, waited);
        }
        Ok(waited)
    }
}
