use async_trait::async_trait;
use pairscan::{
    CachedSnapshot, FetchResult, PairFetcher, PairMetadata, Payload, RateLimiterConfig,
    RequestRateLimiter, Scheduler, SchedulerConfig, SnapshotSink, StateStore, SwrCache,
    TierCadences, TokioClock,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct RecordingSink {
    tx: mpsc::UnboundedSender<(String, bool, Payload)>,
}

#[async_trait]
impl SnapshotSink for RecordingSink {
    async fn on_snapshot(
        &self,
        pair: &PairMetadata,
        snapshot: &CachedSnapshot,
        was_stale: bool,
    ) -> anyhow::Result<()> {
        self.tx
            .send((pair.pair_key.clone(), was_stale, snapshot.payload.clone()))
            .map_err(|e| anyhow::anyhow!("receiver dropped: {}", e))
    }
}

fn price_payload(price: f64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("price".to_string(), json!(price));
    payload
}

fn paused_store() -> Arc<StateStore> {
    Arc::new(StateStore::with_clock(None, Arc::new(TokioClock::new())))
}

/// Seed two pairs, subscribe a chat, and check one loop iteration reaches the sink.
#[tokio::test(start_paused = true)]
async fn first_poll_delivers_fresh_snapshot() {
    let store = paused_store();
    store
        .initialize_pairs(
            &[
                PairMetadata::new("pair1", "WETH/USDC"),
                PairMetadata::new("pair2", "AERO/WETH"),
            ],
            1,
        )
        .await;
    assert_eq!(store.get_scan_set().await, vec!["pair1"]);

    store.subscribe_pair(42, "pair1").await.unwrap();
    assert_eq!(store.list_pair_subscribers("pair1").await, vec![42]);

    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let fetcher: Arc<dyn PairFetcher> = Arc::new(move |_: PairMetadata| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, anyhow::Error>(FetchResult::fresh(price_payload(1.0))) }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let swr = SwrCache::new(Arc::clone(&store), Duration::from_secs(1), None).unwrap();
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::new(swr),
        Arc::new(RequestRateLimiter::new(RateLimiterConfig::default()).unwrap()),
        fetcher,
        SchedulerConfig {
            cadences: TierCadences::new(
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ),
            acquire_timeout: None,
        },
    )
    .with_snapshot_sink(Arc::new(RecordingSink { tx }));

    scheduler.start().await;
    scheduler.await_ready().await;

    let (pair_key, was_stale, payload) = rx.recv().await.unwrap();
    scheduler.stop().await;

    assert_eq!(pair_key, "pair1");
    assert!(!was_stale);
    assert_eq!(payload["price"], json!(1.0));
    assert!(rx.try_recv().is_err(), "callback should fire exactly once");
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let state = scheduler.pair_state("pair1").await.unwrap();
    assert_eq!(state.watchers, 1);
    assert!(state.last_error.is_none());
}

/// With ttl=1s and stale_window=2s, five failing revalidations 0.4s apart
/// serve the cached value: fresh for calls 1-2, stale for calls 3-5.
#[tokio::test(start_paused = true)]
async fn failing_upstream_degrades_to_stale_then_errors() {
    let store = paused_store();
    let cache = SwrCache::new(
        Arc::clone(&store),
        Duration::from_secs(1),
        Some(Duration::from_secs(2)),
    )
    .unwrap();

    let (seeded, _) = cache
        .get_or_fetch(
            "pair1",
            || async { Ok::<_, anyhow::Error>(FetchResult::fresh(price_payload(1.0))) },
            true,
        )
        .await
        .unwrap();

    let mut flags = Vec::new();
    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(400)).await;
        let (snapshot, stale) = cache
            .get_or_fetch(
                "pair1",
                || async { Err::<FetchResult, _>(anyhow::anyhow!("upstream down")) },
                true,
            )
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&snapshot, &seeded));
        assert_eq!(snapshot.payload["price"], json!(1.0));
        flags.push(stale);
    }
    assert_eq!(flags, vec![false, false, true, true, true]);

    // Past the stale window the failure surfaces
    tokio::time::advance(Duration::from_millis(400)).await;
    let result = cache
        .get_or_fetch(
            "pair1",
            || async { Err::<FetchResult, _>(anyhow::anyhow!("upstream down")) },
            true,
        )
        .await;
    assert!(result.is_err());
}

/// The same degradation, driven by the loop: one good fetch, then an upstream
/// that keeps failing. Hot cadence 0.6s puts polls at ages ~0, 0.6, 1.2, 1.8
/// and 2.4s against ttl=1s and stale_window=2s.
#[tokio::test(start_paused = true)]
async fn scheduled_polls_degrade_to_stale_then_error() {
    let store = paused_store();
    store
        .initialize_pairs(&[PairMetadata::new("pair1", "WETH/USDC")], 1)
        .await;
    for chat in 1..=5 {
        store.subscribe_pair(chat, "pair1").await.unwrap();
    }

    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let fetcher: Arc<dyn PairFetcher> = Arc::new(move |_: PairMetadata| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Ok::<FetchResult, anyhow::Error>(FetchResult::fresh(price_payload(1.0)))
            } else {
                Err(anyhow::anyhow!("upstream down"))
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let swr = SwrCache::new(
        Arc::clone(&store),
        Duration::from_secs(1),
        Some(Duration::from_secs(2)),
    )
    .unwrap();
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::new(swr),
        Arc::new(RequestRateLimiter::new(RateLimiterConfig::default()).unwrap()),
        fetcher,
        SchedulerConfig {
            cadences: TierCadences::new(
                Duration::from_millis(600),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ),
            acquire_timeout: None,
        },
    )
    .with_snapshot_sink(Arc::new(RecordingSink { tx }));

    scheduler.start().await;
    scheduler.await_ready().await;

    let mut flags = Vec::new();
    for _ in 0..4 {
        let (pair_key, was_stale, payload) = rx.recv().await.unwrap();
        assert_eq!(pair_key, "pair1");
        assert_eq!(payload["price"], json!(1.0));
        flags.push(was_stale);
    }
    assert_eq!(flags, vec![false, false, true, true]);

    // Fifth poll lands past the stale window: no callback, error recorded
    tokio::time::sleep(Duration::from_secs(1)).await;
    scheduler.stop().await;

    assert!(rx.try_recv().is_err());
    let state = scheduler.pair_state("pair1").await.unwrap();
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("upstream down")));
    assert!(fetches.load(Ordering::SeqCst) >= 4);
}

/// A pair whose fetches keep failing stays scheduled and records the error.
#[tokio::test(start_paused = true)]
async fn loop_survives_persistent_fetch_failure() {
    let store = paused_store();
    store
        .initialize_pairs(&[PairMetadata::new("pair1", "WETH/USDC")], 1)
        .await;

    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let fetcher: Arc<dyn PairFetcher> = Arc::new(move |_: PairMetadata| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<FetchResult, _>(anyhow::anyhow!("connection refused")) }
    });

    let swr = SwrCache::new(Arc::clone(&store), Duration::from_secs(1), None).unwrap();
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::new(swr),
        Arc::new(RequestRateLimiter::new(RateLimiterConfig::default()).unwrap()),
        fetcher,
        SchedulerConfig {
            cadences: TierCadences::new(
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ),
            acquire_timeout: None,
        },
    );

    scheduler.start().await;
    scheduler.await_ready().await;
    // Warm cadence is 5s +/- 7.5%, so 12s covers at least two more polls
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert!(scheduler.is_running().await);
    assert!(fetches.load(Ordering::SeqCst) >= 3);
    let state = scheduler.pair_state("pair1").await.unwrap();
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection refused")));

    scheduler.stop().await;
    assert!(!scheduler.is_running().await);
}
