//! Tiered polling scheduler
//!
//! A single loop task always polls the earliest-due tracked pair: it takes
//! rate-limit budget for the pair's upstream host, revalidates through the
//! SWR cache, hands the snapshot to the registered sink, then reschedules
//! at the cadence of the tier implied by the pair's current watcher count.

use crate::domain::{CachedSnapshot, FetchResult, PairMetadata, PollingTier, TierCadences};
use crate::error::{Result, ScanError};
use crate::infra::ratelimit::RequestRateLimiter;
use crate::infra::store::StateStore;
use crate::infra::swr::SwrCache;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Floor applied to every reschedule delay
const MIN_RESCHEDULE_DELAY: Duration = Duration::from_millis(500);
/// Full spread of the reschedule jitter as a fraction of the cadence
const RESCHEDULE_JITTER: f64 = 0.15;
/// Offset between initial due times of newly tracked pairs
const ENTRY_STAGGER: Duration = Duration::from_secs(1);
/// Wait between checks while nothing is tracked
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Upstream data source for a pair
#[async_trait]
pub trait PairFetcher: Send + Sync {
    async fn fetch(&self, pair: &PairMetadata) -> anyhow::Result<FetchResult>;
}

#[async_trait]
impl<F, Fut> PairFetcher for F
where
    F: Fn(PairMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<FetchResult>> + Send + 'static,
{
    async fn fetch(&self, pair: &PairMetadata) -> anyhow::Result<FetchResult> {
        (self)(pair.clone()).await
    }
}

/// Receives every snapshot produced by a successful poll
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn on_snapshot(
        &self,
        pair: &PairMetadata,
        snapshot: &CachedSnapshot,
        was_stale: bool,
    ) -> anyhow::Result<()>;
}

/// Maps a pair to the per-host rate limit bucket it should draw from
pub type HostResolver = Arc<dyn Fn(&PairMetadata) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub cadences: TierCadences,
    /// Upper bound on rate-limit waits; `None` waits as long as needed
    pub acquire_timeout: Option<Duration>,
}

/// Result of the most recent poll of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollStatus {
    #[default]
    Pending,
    Fresh,
    Stale,
    Error,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Pending => "pending",
            PollStatus::Fresh => "fresh",
            PollStatus::Stale => "stale",
            PollStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for PollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairState {
    pub pair_key: String,
    pub tier: PollingTier,
    pub next_run: Instant,
    pub watchers: usize,
    pub last_status: PollStatus,
    pub last_error: Option<String>,
}

impl PairState {
    fn new(pair_key: &str, next_run: Instant) -> Self {
        Self {
            pair_key: pair_key.to_string(),
            tier: PollingTier::Warm,
            next_run,
            watchers: 0,
            last_status: PollStatus::Pending,
            last_error: None,
        }
    }
}

enum NextPoll {
    Due(String),
    Wait(Duration),
}

/// Everything the loop task needs, shared with the owning `Scheduler`
#[derive(Clone)]
struct PollCore {
    store: Arc<StateStore>,
    swr: Arc<SwrCache>,
    limiter: Arc<RequestRateLimiter>,
    fetcher: Arc<dyn PairFetcher>,
    sink: Arc<RwLock<Option<Arc<dyn SnapshotSink>>>>,
    host_resolver: HostResolver,
    config: SchedulerConfig,
    states: Arc<Mutex<HashMap<String, PairState>>>,
    refresh: Arc<Notify>,
    ready: Arc<watch::Sender<bool>>,
}

pub struct Scheduler {
    core: PollCore,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<StateStore>,
        swr: Arc<SwrCache>,
        limiter: Arc<RequestRateLimiter>,
        fetcher: Arc<dyn PairFetcher>,
        config: SchedulerConfig,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);

        Self {
            core: PollCore {
                store,
                swr,
                limiter,
                fetcher,
                sink: Arc::new(RwLock::new(None)),
                host_resolver: Arc::new(|_: &PairMetadata| None),
                config,
                states: Arc::new(Mutex::new(HashMap::new())),
                refresh: Arc::new(Notify::new()),
                ready: Arc::new(ready_tx),
            },
            task: Mutex::new(None),
            stop_tx,
            ready_rx,
        }
    }

    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.core.sink = Arc::new(RwLock::new(Some(sink)));
        self
    }

    pub fn with_host_resolver(mut self, resolver: HostResolver) -> Self {
        self.core.host_resolver = resolver;
        self
    }

    /// Replace (or clear) the sink while the loop is running
    pub async fn set_snapshot_sink(&self, sink: Option<Arc<dyn SnapshotSink>>) {
        *self.core.sink.write().await = sink;
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Sync tracked pairs from the store and spawn the loop. No-op if running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        {
            let mut states = self.core.states.lock().await;
            self.core.refresh_locked(&mut states).await;
            info!("Scheduler starting with {} tracked pairs", states.len());
        }

        self.stop_tx.send_replace(false);
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(self.core.clone().run(stop_rx)));
    }

    /// Signal the loop and wait for it to exit. A poll already underway
    /// completes first; no new poll starts. No-op if not running.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return;
        };

        self.stop_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!("Scheduler loop ended abnormally: {}", e);
        }
        self.core.ready.send_replace(false);
        info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Resolves once the loop has begun iterating
    pub async fn await_ready(&self) {
        let mut ready = self.ready_rx.clone();
        // The sender lives in `core`, so this only errors if we are being dropped
        let _ = ready.wait_for(|is_ready| *is_ready).await;
    }

    /// Re-derive the tracked set from the store's scan set
    pub async fn trigger_refresh(&self) {
        {
            let mut states = self.core.states.lock().await;
            self.core.refresh_locked(&mut states).await;
        }
        self.core.refresh.notify_one();
    }

    /// Copies of all tracked pair states, earliest due first
    pub async fn pair_states(&self) -> Vec<PairState> {
        let mut states: Vec<PairState> = self.core.states.lock().await.values().cloned().collect();
        states.sort_by(|a, b| a.next_run.cmp(&b.next_run));
        states
    }

    pub async fn pair_state(&self, pair_key: &str) -> Option<PairState> {
        self.core.states.lock().await.get(pair_key).cloned()
    }
}

impl PollCore {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        self.ready.send_replace(true);
        debug!("Scheduler loop running");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            match self.next_poll().await {
                NextPoll::Due(pair_key) => self.poll_pair(&pair_key).await,
                NextPoll::Wait(wait) => {
                    tokio::select! {
                        changed = stop_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = self.refresh.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        self.ready.send_replace(false);
        debug!("Scheduler loop exited");
    }

    async fn next_poll(&self) -> NextPoll {
        let states = self.states.lock().await;
        let Some(state) = states.values().min_by_key(|state| state.next_run) else {
            return NextPoll::Wait(IDLE_WAIT);
        };

        let now = Instant::now();
        if state.next_run <= now {
            NextPoll::Due(state.pair_key.clone())
        } else {
            NextPoll::Wait(state.next_run - now)
        }
    }

    async fn poll_pair(&self, pair_key: &str) {
        let Some(metadata) = self.store.get_pair_metadata(pair_key).await else {
            warn!("Metadata for {} disappeared, dropping it from polling", pair_key);
            self.states.lock().await.remove(pair_key);
            return;
        };
        // A refresh may have dropped the key since it was picked
        if !self.states.lock().await.contains_key(pair_key) {
            debug!("{} left the scan set before polling, skipping", pair_key);
            return;
        }

        match self.poll_once(&metadata).await {
            Ok(status) => {
                debug!("Polled {} ({})", pair_key, status);
                self.update_watchers(pair_key).await;
                self.reschedule(pair_key, status, None).await;
            }
            Err(e) => {
                warn!("Polling failed for {}: {}", pair_key, e);
                self.reschedule(pair_key, PollStatus::Error, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn poll_once(&self, metadata: &PairMetadata) -> Result<PollStatus> {
        let host = (self.host_resolver)(metadata);
        self.limiter
            .acquire(host.as_deref(), 1.0, self.config.acquire_timeout)
            .await?;

        let fetcher = Arc::clone(&self.fetcher);
        let pair = metadata.clone();
        let (snapshot, was_stale) = self
            .swr
            .get_or_fetch(
                &metadata.pair_key,
                move || async move { fetcher.fetch(&pair).await },
                true,
            )
            .await?;

        let sink = self.sink.read().await.clone();
        if let Some(sink) = sink {
            sink.on_snapshot(metadata, &snapshot, was_stale)
                .await
                .map_err(|e| ScanError::Callback {
                    pair_key: metadata.pair_key.clone(),
                    reason: format!("{:#}", e),
                })?;
        }

        Ok(if was_stale {
            PollStatus::Stale
        } else {
            PollStatus::Fresh
        })
    }

    async fn update_watchers(&self, pair_key: &str) {
        let watchers = self.store.list_pair_subscribers(pair_key).await.len();
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(pair_key) else {
            return;
        };

        state.watchers = watchers;
        let tier = PollingTier::for_watchers(watchers);
        if tier != state.tier {
            info!(
                "{} moved {} -> {} ({} watchers)",
                pair_key, state.tier, tier, watchers
            );
            state.tier = tier;
            state.next_run = Instant::now() + self.config.cadences.for_tier(tier);
        }
    }

    async fn reschedule(&self, pair_key: &str, status: PollStatus, error: Option<String>) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(pair_key) else {
            return;
        };

        let cadence = self.config.cadences.for_tier(state.tier);
        state.next_run = Instant::now() + jittered_delay(cadence);
        state.last_status = status;
        state.last_error = error;
    }

    async fn refresh_locked(&self, states: &mut HashMap<String, PairState>) {
        let scan_set = self.store.get_scan_set().await;
        let known: HashSet<String> = self
            .store
            .list_pair_metadata()
            .await
            .into_iter()
            .map(|meta| meta.pair_key)
            .collect();

        let now = Instant::now();
        for pair_key in &scan_set {
            if !known.contains(pair_key) || states.contains_key(pair_key) {
                continue;
            }
            let offset = ENTRY_STAGGER * states.len() as u32;
            states.insert(pair_key.clone(), PairState::new(pair_key, now + offset));
            debug!("Tracking {} (first poll in {:?})", pair_key, offset);
        }

        let wanted: HashSet<&String> = scan_set.iter().collect();
        states.retain(|pair_key, _| {
            let keep = wanted.contains(pair_key);
            if !keep {
                debug!("No longer tracking {}", pair_key);
            }
            keep
        });
    }
}

/// Cadence with +/- 7.5% jitter, floored at `MIN_RESCHEDULE_DELAY`
fn jittered_delay(cadence: Duration) -> Duration {
    let half_spread = cadence.as_secs_f64() * RESCHEDULE_JITTER / 2.0;
    let offset = rand::thread_rng().gen_range(-half_spread..=half_spread);
    Duration::from_secs_f64(cadence.as_secs_f64() + offset).max(MIN_RESCHEDULE_DELAY)
}
