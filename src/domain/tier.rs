use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Watcher count at which a pair is polled at the hot cadence
pub const HOT_WATCHER_THRESHOLD: usize = 5;

/// Polling-frequency class derived from subscriber count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollingTier {
    Hot,
    Warm,
    Cold,
}

impl PollingTier {
    /// Tier for a given number of watchers: 5+ hot, 1-4 warm, 0 cold
    pub fn for_watchers(watchers: usize) -> Self {
        if watchers >= HOT_WATCHER_THRESHOLD {
            PollingTier::Hot
        } else if watchers >= 1 {
            PollingTier::Warm
        } else {
            PollingTier::Cold
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollingTier::Hot => "hot",
            PollingTier::Warm => "warm",
            PollingTier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for PollingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Base polling interval per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCadences {
    pub hot: Duration,
    pub warm: Duration,
    pub cold: Duration,
}

impl TierCadences {
    pub fn new(hot: Duration, warm: Duration, cold: Duration) -> Self {
        Self { hot, warm, cold }
    }

    pub fn for_tier(&self, tier: PollingTier) -> Duration {
        match tier {
            PollingTier::Hot => self.hot,
            PollingTier::Warm => self.warm,
            PollingTier::Cold => self.cold,
        }
    }
}

impl Default for TierCadences {
    fn default() -> Self {
        Self {
            hot: Duration::from_secs(8),
            warm: Duration::from_secs(24),
            cold: Duration::from_secs(60),
        }
    }
}
