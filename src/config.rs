use crate::domain::{split_symbols, PairMetadata, TierCadences};
use crate::error::{Result, ScanError};
use crate::infra::{RateLimiterConfig, SchedulerConfig};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Maximum number of pairs seeded into the scan set
    #[serde(default = "default_scan_size")]
    pub size: usize,
    /// JSON file with the pair definitions
    #[serde(default = "default_pairs_path")]
    pub pairs_path: PathBuf,
}

fn default_scan_size() -> usize {
    10
}

fn default_pairs_path() -> PathBuf {
    PathBuf::from("config/scan_set.json")
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            size: default_scan_size(),
            pairs_path: default_pairs_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: f64,
    /// How long past its TTL a snapshot may still be served on fetch failure.
    /// Defaults to twice the TTL.
    #[serde(default)]
    pub stale_window_secs: Option<f64>,
}

fn default_ttl_secs() -> f64 {
    15.0
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            stale_window_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_hot_secs")]
    pub hot_secs: f64,
    #[serde(default = "default_warm_secs")]
    pub warm_secs: f64,
    #[serde(default = "default_cold_secs")]
    pub cold_secs: f64,
    /// Cap on rate-limit waits per poll (no cap when absent)
    #[serde(default)]
    pub acquire_timeout_secs: Option<f64>,
}

fn default_hot_secs() -> f64 {
    8.0
}

fn default_warm_secs() -> f64 {
    24.0
}

fn default_cold_secs() -> f64 {
    60.0
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            hot_secs: default_hot_secs(),
            warm_secs: default_warm_secs(),
            cold_secs: default_cold_secs(),
            acquire_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_global_reqs_per_min")]
    pub global_reqs_per_min: u32,
    #[serde(default = "default_burst_ratio")]
    pub burst_ratio: f64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Per-host ceilings in requests per minute
    #[serde(default = "default_host_limits")]
    pub hosts: BTreeMap<String, u32>,
}

fn default_global_reqs_per_min() -> u32 {
    120
}

fn default_burst_ratio() -> f64 {
    0.2
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_host_limits() -> BTreeMap<String, u32> {
    BTreeMap::from([("dexscreener".to_string(), 60), ("evm".to_string(), 45)])
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_reqs_per_min: default_global_reqs_per_min(),
            burst_ratio: default_burst_ratio(),
            jitter_ratio: default_jitter_ratio(),
            hosts: default_host_limits(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Disk snapshot location; an empty string disables persistence
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

fn default_snapshot_path() -> String {
    "data/store_snapshot.json".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Request URL with `{pair_key}`, `{base_address}`, `{quote_address}`
    /// and `{dex_id}` placeholders
    #[serde(default = "default_url_template")]
    pub url_template: String,
    /// Rate-limit host class charged for every fetch
    #[serde(default = "default_fetch_host")]
    pub host: String,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_url_template() -> String {
    "https://api.dexscreener.com/latest/dex/tokens/{base_address}".to_string()
}

fn default_fetch_host() -> String {
    "dexscreener".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            host: default_fetch_host(),
            timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/` and the environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("scan.size", 10)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PAIRSCAN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // PAIRSCAN_CACHE__TTL_SECS, PAIRSCAN_RATE_LIMIT__HOSTS__EVM, ...
            .add_source(
                Environment::with_prefix("PAIRSCAN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Check value ranges, collecting every violation into one error
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.scan.size < 1 {
            errors.push("scan.size must be at least 1".to_string());
        }

        if !at_least(self.cache.ttl_secs, 0.1) {
            errors.push("cache.ttl_secs must be at least 0.1".to_string());
        }
        if let Some(window) = self.cache.stale_window_secs {
            if !at_least(window, 0.0) {
                errors.push("cache.stale_window_secs must be non-negative".to_string());
            }
        }

        for (name, value) in [
            ("scheduler.hot_secs", self.scheduler.hot_secs),
            ("scheduler.warm_secs", self.scheduler.warm_secs),
            ("scheduler.cold_secs", self.scheduler.cold_secs),
        ] {
            if !at_least(value, 0.1) {
                errors.push(format!("{name} must be at least 0.1"));
            }
        }
        if let Some(timeout) = self.scheduler.acquire_timeout_secs {
            if !at_least(timeout, 0.0) {
                errors.push("scheduler.acquire_timeout_secs must be non-negative".to_string());
            }
        }

        if self.rate_limit.global_reqs_per_min < 1 {
            errors.push("rate_limit.global_reqs_per_min must be at least 1".to_string());
        }
        if !at_least(self.rate_limit.burst_ratio, 0.0) {
            errors.push("rate_limit.burst_ratio must be non-negative".to_string());
        }
        if !(0.0..1.0).contains(&self.rate_limit.jitter_ratio) {
            errors.push("rate_limit.jitter_ratio must be in [0, 1)".to_string());
        }
        for (host, rate) in &self.rate_limit.hosts {
            if *rate < 1 {
                errors.push(format!("rate_limit.hosts.{host} must be at least 1"));
            }
        }

        if self.fetcher.url_template.trim().is_empty() {
            errors.push("fetcher.url_template must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ScanError::InvalidConfig(errors.join("; ")))
        }
    }

    /// Scan size clamped to the number of configured pairs
    pub fn effective_scan_size(&self, pair_count: usize) -> usize {
        if pair_count == 0 {
            self.scan.size
        } else {
            self.scan.size.min(pair_count)
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache.ttl_secs)
    }

    pub fn stale_window(&self) -> Option<Duration> {
        self.cache.stale_window_secs.map(Duration::from_secs_f64)
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        let path = self.store.snapshot_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            cadences: TierCadences::new(
                Duration::from_secs_f64(self.scheduler.hot_secs),
                Duration::from_secs_f64(self.scheduler.warm_secs),
                Duration::from_secs_f64(self.scheduler.cold_secs),
            ),
            acquire_timeout: self
                .scheduler
                .acquire_timeout_secs
                .map(Duration::from_secs_f64),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            global_rate_per_min: self.rate_limit.global_reqs_per_min,
            burst_ratio: self.rate_limit.burst_ratio,
            jitter_ratio: self.rate_limit.jitter_ratio,
        }
    }
}

/// Read pair definitions from a JSON array file
pub fn load_scan_pairs(path: &Path) -> Result<Vec<PairMetadata>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ScanError::InvalidConfig(format!(
            "Scan set file '{}' could not be read: {}",
            path.display(),
            e
        ))
    })?;
    let payload: Value = serde_json::from_str(&raw).map_err(|e| {
        ScanError::InvalidConfig(format!(
            "Scan set file '{}' must be valid JSON: {}",
            path.display(),
            e
        ))
    })?;
    parse_scan_pairs(&payload)
}

/// Parse pair definitions, accepting the short aliases (`key`, `pair`,
/// `base`, `quote`, `fees`) used by hand-written scan files
pub fn parse_scan_pairs(payload: &Value) -> Result<Vec<PairMetadata>> {
    let entries = payload.as_array().ok_or_else(|| {
        ScanError::InvalidConfig("Scan set file must contain a list of pair definitions".into())
    })?;

    entries.iter().map(parse_scan_entry).collect()
}

fn parse_scan_entry(entry: &Value) -> Result<PairMetadata> {
    let entry = entry.as_object().ok_or_else(|| {
        ScanError::InvalidConfig("Each scan set entry must be a JSON object".into())
    })?;

    let field = |names: &[&str]| -> Option<String> {
        names
            .iter()
            .filter_map(|name| entry.get(*name))
            .filter_map(scalar_text)
            .find(|text| !text.is_empty())
    };

    let pair_key = field(&["pair_key", "key"]).ok_or_else(|| {
        ScanError::InvalidConfig("Scan set entries require a 'pair_key'".into())
    })?;
    let symbols = field(&["symbols", "pair"]).unwrap_or_else(|| pair_key.clone());
    let (split_base, split_quote) = split_symbols(&symbols);
    let base_symbol = field(&["base_symbol", "base"]).unwrap_or(split_base);
    let quote_symbol = field(&["quote_symbol", "quote"]).unwrap_or(split_quote);

    let fee_tiers = ["fee_tiers", "fees"]
        .iter()
        .find_map(|name| entry.get(*name).filter(|v| !v.is_null()))
        .map(|raw| match raw {
            Value::Array(items) => items
                .iter()
                .filter_map(scalar_text)
                .filter(|tier| !tier.is_empty())
                .collect(),
            other => scalar_text(other)
                .filter(|tier| !tier.is_empty())
                .into_iter()
                .collect(),
        })
        .unwrap_or_default();

    Ok(PairMetadata {
        base_symbol,
        quote_symbol,
        base_address: field(&["base_address"]),
        quote_address: field(&["quote_address"]),
        dex_id: field(&["dex_id"]),
        fee_tiers,
        symbols,
        pair_key,
    })
}

fn at_least(value: f64, min: f64) -> bool {
    value.is_finite() && value >= min
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
