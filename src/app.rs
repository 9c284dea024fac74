//! Runtime wiring and the administrative mutation surface
//!
//! Every admin mutation goes through the store and is followed by a
//! scheduler resync, so the tracked set never lags the scan set.

use crate::config::AppConfig;
use crate::domain::{ChatId, PairMetadata};
use crate::error::Result;
use crate::infra::{
    HostResolver, PairFetcher, RequestRateLimiter, Scheduler, SnapshotSink, StateStore, SwrCache,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

pub struct PairScanner {
    store: Arc<StateStore>,
    limiter: Arc<RequestRateLimiter>,
    swr: Arc<SwrCache>,
    scheduler: Scheduler,
    scan_size: usize,
}

impl PairScanner {
    /// Build the full stack: restore the disk snapshot, seed the scan set,
    /// then wire limiter, cache and scheduler from `config`
    pub async fn build(
        config: &AppConfig,
        pairs: &[PairMetadata],
        fetcher: Arc<dyn PairFetcher>,
        sink: Option<Arc<dyn SnapshotSink>>,
    ) -> Result<Self> {
        let store = Arc::new(StateStore::new(config.snapshot_path()));
        if store.load_snapshot().await {
            info!("Restored store snapshot");
        }
        Self::with_store(config, store, pairs, fetcher, sink).await
    }

    /// Like `build`, but around a caller-supplied store (custom clock or path)
    pub async fn with_store(
        config: &AppConfig,
        store: Arc<StateStore>,
        pairs: &[PairMetadata],
        fetcher: Arc<dyn PairFetcher>,
        sink: Option<Arc<dyn SnapshotSink>>,
    ) -> Result<Self> {
        config.validate()?;

        store
            .initialize_pairs(pairs, config.effective_scan_size(pairs.len()))
            .await;

        let limiter = Arc::new(RequestRateLimiter::with_hosts(
            config.rate_limiter_config(),
            config
                .rate_limit
                .hosts
                .iter()
                .map(|(host, rate)| (host.clone(), *rate)),
        )?);
        let swr = Arc::new(SwrCache::new(
            Arc::clone(&store),
            config.cache_ttl(),
            config.stale_window(),
        )?);

        let mut scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&swr),
            Arc::clone(&limiter),
            fetcher,
            config.scheduler_config(),
        )
        .with_host_resolver(fixed_host(&config.fetcher.host));
        if let Some(sink) = sink {
            scheduler = scheduler.with_snapshot_sink(sink);
        }

        Ok(Self {
            store,
            limiter,
            swr,
            scheduler,
            scan_size: config.scan.size,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn rate_limiter(&self) -> &Arc<RequestRateLimiter> {
        &self.limiter
    }

    pub fn swr_cache(&self) -> &Arc<SwrCache> {
        &self.swr
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Upper bound on the scan set for admin mutations
    pub fn scan_size(&self) -> usize {
        self.scan_size
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Register (or update) a pair and make sure it is scanned.
    /// Returns whether it was newly added to the scan set.
    ///
    /// A full scan set fails with `ScanSetFull`; the metadata stays registered.
    pub async fn add_pair(&self, metadata: PairMetadata) -> Result<bool> {
        let pair_key = metadata.pair_key.clone();
        self.store.upsert_pair_metadata(metadata).await;
        let added = self
            .store
            .ensure_pair_in_scan_set(&pair_key, self.scan_size)
            .await?;
        self.scheduler.trigger_refresh().await;
        Ok(added)
    }

    pub async fn remove_pair(&self, pair_key: &str) -> bool {
        let removed = self.store.remove_pair(pair_key).await;
        if removed {
            self.scheduler.trigger_refresh().await;
        }
        removed
    }

    /// Replace the scan set, returning `(removed, added)`.
    /// Keys past the configured scan size are dropped in input order.
    pub async fn replace_scan_set(
        &self,
        pair_keys: &[String],
    ) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut bounded: Vec<String> = Vec::with_capacity(self.scan_size);
        for (idx, key) in pair_keys.iter().enumerate() {
            if bounded.len() >= self.scan_size {
                info!(
                    "Scan set capped at {}; dropping {} requested key(s)",
                    self.scan_size,
                    pair_keys.len() - idx
                );
                break;
            }
            if !bounded.contains(key) {
                bounded.push(key.clone());
            }
        }
        let diff = self.store.set_scan_set(&bounded).await?;
        self.scheduler.trigger_refresh().await;
        Ok(diff)
    }

    pub async fn subscribe(&self, chat_id: ChatId, pair_key: &str) -> Result<()> {
        self.store.subscribe_pair(chat_id, pair_key).await?;
        self.scheduler.trigger_refresh().await;
        Ok(())
    }

    pub async fn unsubscribe(&self, chat_id: ChatId, pair_key: &str) {
        self.store.unsubscribe_pair(chat_id, pair_key).await;
        self.scheduler.trigger_refresh().await;
    }
}

/// Resolver charging every pair to one host bucket; blank means none
fn fixed_host(host: &str) -> HostResolver {
    let host = host.trim().to_string();
    Arc::new(move |_: &PairMetadata| (!host.is_empty()).then(|| host.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FetchResult, Payload, TokioClock};
    use crate::error::ScanError;

    fn no_persistence() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.snapshot_path = String::new();
        config
    }

    fn stub_fetcher() -> Arc<dyn PairFetcher> {
        Arc::new(|_: PairMetadata| async { Ok::<_, anyhow::Error>(FetchResult::fresh(Payload::new())) })
    }

    fn pairs() -> Vec<PairMetadata> {
        vec![
            PairMetadata::new("pair1", "WETH/USDC"),
            PairMetadata::new("pair2", "AERO/WETH"),
        ]
    }

    #[test]
    fn test_fixed_host() {
        let pair = PairMetadata::new("p", "A/B");
        assert_eq!(fixed_host("evm")(&pair), Some("evm".to_string()));
        assert_eq!(fixed_host(" ")(&pair), None);
    }

    #[tokio::test]
    async fn test_build_seeds_scan_set_and_hosts() {
        let mut config = no_persistence();
        config.scan.size = 1;

        let scanner = PairScanner::build(&config, &pairs(), stub_fetcher(), None)
            .await
            .unwrap();

        assert_eq!(scanner.store().get_scan_set().await, vec!["pair1"]);
        assert!(scanner.rate_limiter().has_host("dexscreener"));
        assert!(scanner.rate_limiter().has_host("evm"));
        assert_eq!(scanner.swr_cache().stale_window(), config.cache_ttl() * 2);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = no_persistence();
        config.cache.ttl_secs = 0.0;

        let result = PairScanner::build(&config, &pairs(), stub_fetcher(), None).await;
        assert!(matches!(result, Err(ScanError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_mutations_resync_scheduler() {
        let mut config = no_persistence();
        config.scan.size = 2;
        let store = Arc::new(StateStore::with_clock(None, Arc::new(TokioClock::new())));
        let scanner = PairScanner::with_store(&config, store, &pairs()[..1], stub_fetcher(), None)
            .await
            .unwrap();
        scanner.scheduler().trigger_refresh().await;
        assert_eq!(scanner.scheduler().pair_states().await.len(), 1);

        assert!(scanner
            .add_pair(PairMetadata::new("pair3", "CBBTC/USDC"))
            .await
            .unwrap());
        assert!(scanner.scheduler().pair_state("pair3").await.is_some());

        scanner
            .store()
            .upsert_pair_metadata(PairMetadata::new("pair2", "AERO/WETH"))
            .await;
        let (removed, added) = scanner
            .replace_scan_set(&["pair2".to_string(), "pair3".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, BTreeSet::from(["pair1".to_string()]));
        assert_eq!(added, BTreeSet::from(["pair2".to_string()]));
        assert!(scanner.scheduler().pair_state("pair1").await.is_none());

        assert!(scanner.remove_pair("pair3").await);
        assert!(!scanner.remove_pair("pair3").await);
        assert!(scanner.scheduler().pair_state("pair3").await.is_none());

        scanner.subscribe(42, "pair2").await.unwrap();
        assert_eq!(scanner.store().list_pair_subscribers("pair2").await, vec![42]);
        assert!(scanner.subscribe(42, "pair3").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_mutations_respect_scan_size() {
        let mut config = no_persistence();
        config.scan.size = 2;
        let many: Vec<PairMetadata> = (0..5)
            .map(|i| PairMetadata::new(&format!("p{}", i), "A/B"))
            .collect();
        let store = Arc::new(StateStore::with_clock(None, Arc::new(TokioClock::new())));
        let scanner = PairScanner::with_store(&config, store, &many, stub_fetcher(), None)
            .await
            .unwrap();
        assert_eq!(scanner.scan_size(), 2);

        let requested: Vec<String> = (0..5).rev().map(|i| format!("p{}", i)).collect();
        scanner.replace_scan_set(&requested).await.unwrap();
        assert_eq!(scanner.store().get_scan_set().await, vec!["p4", "p3"]);
        assert_eq!(scanner.scheduler().pair_states().await.len(), 2);

        let err = scanner
            .add_pair(PairMetadata::new("p9", "C/D"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ScanSetFull(2)));
        assert!(scanner.store().get_pair_metadata("p9").await.is_some());
        assert_eq!(scanner.store().get_scan_set().await.len(), 2);
        assert_eq!(scanner.scheduler().pair_states().await.len(), 2);

        assert!(scanner.remove_pair("p4").await);
        assert!(scanner
            .add_pair(PairMetadata::new("p9", "C/D"))
            .await
            .unwrap());
        assert_eq!(scanner.store().get_scan_set().await, vec!["p3", "p9"]);
    }
}
