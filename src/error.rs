use thiserror::Error;

/// Main error type for the pair scanner
#[derive(Error, Debug)]
pub enum ScanError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Store errors
    #[error("Unknown pair key '{0}'")]
    UnknownPairKey(String),

    #[error("Scan set is full ({0} pairs)")]
    ScanSetFull(usize),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    // Polling errors
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Fetch failed for {pair_key}: {reason}")]
    FetchFailure { pair_key: String, reason: String },

    #[error("Snapshot callback failed for {pair_key}: {reason}")]
    Callback { pair_key: String, reason: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ScanError {
    /// Whether the failure is transient and the next poll may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::RateLimitExceeded(_) | ScanError::FetchFailure { .. }
        )
    }
}

/// Result type alias for ScanError
pub type Result<T> = std::result::Result<T, ScanError>;
