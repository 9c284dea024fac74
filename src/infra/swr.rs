//! Coalesced stale-while-revalidate cache.
//!
//! At most one real fetch per pair key is in flight; concurrent callers
//! join the pending fetch through a registry of shared futures. When a
//! fetch fails, a snapshot still inside the stale window is served instead
//! of the error.

use crate::domain::{CachedSnapshot, FetchResult, SnapshotStatus};
use crate::error::{Result, ScanError};
use crate::infra::store::StateStore;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outcome shared between every caller waiting on the same fetch
type FetchOutcome = std::result::Result<Arc<CachedSnapshot>, String>;
type PendingFetch = Shared<BoxFuture<'static, FetchOutcome>>;

pub struct SwrCache {
    store: Arc<StateStore>,
    default_ttl: Duration,
    stale_window: Duration,
    // One entry per key ever fetched; bounded by the number of tracked pairs
    locks: DashMap<String, Arc<Mutex<()>>>,
    inflight: Arc<DashMap<String, PendingFetch>>,
}

impl SwrCache {
    /// `stale_window` defaults to twice the TTL
    pub fn new(
        store: Arc<StateStore>,
        default_ttl: Duration,
        stale_window: Option<Duration>,
    ) -> Result<Self> {
        if default_ttl.is_zero() {
            return Err(ScanError::InvalidConfig(
                "default_ttl must be positive".to_string(),
            ));
        }
        Ok(Self {
            store,
            default_ttl,
            stale_window: stale_window.unwrap_or(default_ttl * 2),
            locks: DashMap::new(),
            inflight: Arc::new(DashMap::new()),
        })
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    pub async fn get_snapshot(&self, pair_key: &str) -> Option<Arc<CachedSnapshot>> {
        self.store.get_swr_snapshot(pair_key).await
    }

    /// Store a fetch result directly, bypassing coalescing
    pub async fn save_snapshot(&self, pair_key: &str, result: FetchResult) -> Arc<CachedSnapshot> {
        let ttl = resolve_ttl(result.ttl, self.default_ttl);
        self.store
            .set_swr_snapshot(pair_key, result.payload, ttl, result.status)
            .await
    }

    /// Return a fresh snapshot, revalidating through `fetch` when needed.
    ///
    /// The flag is `true` when the returned snapshot is stale: either the
    /// fetch failed and a snapshot inside the stale window was served, or
    /// the fetcher tagged its own result as stale.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        pair_key: &str,
        fetch: F,
        allow_stale: bool,
    ) -> Result<(Arc<CachedSnapshot>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<FetchResult>> + Send + 'static,
    {
        let clock = self.store.clock();
        let cached = self.store.get_swr_snapshot(pair_key).await;
        let now = clock.now();
        if let Some(snapshot) = cached.as_ref().filter(|s| s.is_fresh(now)) {
            debug!("SWR hit for {}", pair_key);
            return Ok((Arc::clone(snapshot), false));
        }
        let stale_candidate =
            cached.filter(|s| allow_stale && s.age(now) <= self.stale_window);

        let pending = {
            let lock = self.lock_for(pair_key);
            let _guard = lock.lock().await;

            // Another caller may have refreshed while we waited for the lock
            if let Some(snapshot) = self.store.get_swr_snapshot(pair_key).await {
                if snapshot.is_fresh(clock.now()) {
                    return Ok((snapshot, false));
                }
            }

            let existing = self.inflight.get(pair_key).map(|entry| entry.value().clone());
            match existing {
                Some(pending) => {
                    debug!("Joining in-flight fetch for {}", pair_key);
                    pending
                }
                None => {
                    debug!("Revalidating {}", pair_key);
                    let pending = self.start_fetch(pair_key, fetch());
                    self.inflight.insert(pair_key.to_string(), pending.clone());
                    pending
                }
            }
        };

        match pending.await {
            Ok(snapshot) => {
                let stale = snapshot.status == SnapshotStatus::Stale;
                Ok((snapshot, stale))
            }
            Err(reason) => match stale_candidate {
                Some(snapshot) => {
                    warn!(
                        "Fetch failed for {}, serving stale snapshot (age {:?}): {}",
                        pair_key,
                        snapshot.age(clock.now()),
                        reason
                    );
                    Ok((snapshot, true))
                }
                None => Err(ScanError::FetchFailure {
                    pair_key: pair_key.to_string(),
                    reason,
                }),
            },
        }
    }

    fn lock_for(&self, pair_key: &str) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(pair_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    /// Wrap the fetch so it persists its result and deregisters itself once settled
    fn start_fetch<Fut>(&self, pair_key: &str, fetch: Fut) -> PendingFetch
    where
        Fut: Future<Output = anyhow::Result<FetchResult>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let inflight = Arc::clone(&self.inflight);
        let default_ttl = self.default_ttl;
        let key = pair_key.to_string();

        async move {
            let outcome = match fetch.await {
                Ok(result) => {
                    let ttl = resolve_ttl(result.ttl, default_ttl);
                    Ok(store
                        .set_swr_snapshot(&key, result.payload, ttl, result.status)
                        .await)
                }
                Err(e) => Err(format!("{:#}", e)),
            };
            inflight.remove(&key);
            outcome
        }
        .boxed()
        .shared()
    }
}

/// A missing or zero TTL from the fetcher falls back to the cache default
fn resolve_ttl(ttl: Option<Duration>, default_ttl: Duration) -> Duration {
    ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(default_ttl)
}
