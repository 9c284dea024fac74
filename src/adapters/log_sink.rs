use crate::domain::{CachedSnapshot, PairMetadata};
use crate::infra::SnapshotSink;
use async_trait::async_trait;
use tracing::info;

/// Snapshot sink that only reports through `tracing`
#[derive(Debug, Default, Clone)]
pub struct LoggingSink;

#[async_trait]
impl SnapshotSink for LoggingSink {
    async fn on_snapshot(
        &self,
        pair: &PairMetadata,
        snapshot: &CachedSnapshot,
        was_stale: bool,
    ) -> anyhow::Result<()> {
        info!(
            pair_key = %pair.pair_key,
            symbols = %pair.symbols,
            status = %snapshot.status,
            was_stale,
            captured_at = %snapshot.captured_at,
            fields = snapshot.payload.len(),
            "snapshot"
        );
        Ok(())
    }
}
