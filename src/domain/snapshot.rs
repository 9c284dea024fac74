use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque payload produced by a fetcher
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Quality tag set by the fetcher on its own result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    #[default]
    Fresh,
    /// Degraded but usable
    Stale,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Fresh => "fresh",
            SnapshotStatus::Stale => "stale",
        }
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result returned by a fetcher for one pair
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub payload: Payload,
    /// Overrides the cache's default TTL when set
    pub ttl: Option<Duration>,
    pub status: SnapshotStatus,
}

impl FetchResult {
    pub fn fresh(payload: Payload) -> Self {
        Self {
            payload,
            ttl: None,
            status: SnapshotStatus::Fresh,
        }
    }

    pub fn stale(payload: Payload) -> Self {
        Self {
            payload,
            ttl: None,
            status: SnapshotStatus::Stale,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// The single cached value retained per pair
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub pair_key: String,
    pub payload: Payload,
    pub captured_at: DateTime<Utc>,
    pub ttl: Duration,
    pub status: SnapshotStatus,
}

impl CachedSnapshot {
    /// Time since capture, clamped at zero
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) <= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_at(captured_at: DateTime<Utc>, ttl_secs: u64) -> CachedSnapshot {
        CachedSnapshot {
            pair_key: "base:weth-usdc".to_string(),
            payload: Payload::new(),
            captured_at,
            ttl: Duration::from_secs(ttl_secs),
            status: SnapshotStatus::Fresh,
        }
    }

    #[test]
    fn test_freshness_boundary() {
        let t0 = Utc::now();
        let snap = snapshot_at(t0, 10);

        assert!(snap.is_fresh(t0));
        assert!(snap.is_fresh(t0 + chrono::Duration::seconds(10)));
        assert!(!snap.is_fresh(t0 + chrono::Duration::milliseconds(10_001)));
    }

    #[test]
    fn test_age_never_negative() {
        let t0 = Utc::now();
        let snap = snapshot_at(t0, 10);
        assert_eq!(snap.age(t0 - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            snap.age(t0 + chrono::Duration::seconds(3)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&SnapshotStatus::Stale).unwrap(),
            "\"stale\""
        );
        assert_eq!(SnapshotStatus::default(), SnapshotStatus::Fresh);
    }
}
