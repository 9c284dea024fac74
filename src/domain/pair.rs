use serde::{Deserialize, Serialize};

/// Telegram-style chat identifier used for subscriptions and profiles
pub type ChatId = i64;

/// Opaque per-chat override map (no schema enforced at the store layer)
pub type ChatProfile = serde_json::Map<String, serde_json::Value>;

/// Identity and addressing for one tracked market pair.
///
/// Immutable once built; updates replace the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairMetadata {
    pub pair_key: String,
    #[serde(default)]
    pub symbols: String,
    #[serde(default)]
    pub base_symbol: String,
    #[serde(default)]
    pub quote_symbol: String,
    #[serde(default)]
    pub base_address: Option<String>,
    #[serde(default)]
    pub quote_address: Option<String>,
    /// Venue identifier (e.g. "uniswap", "aerodrome")
    #[serde(default)]
    pub dex_id: Option<String>,
    #[serde(default)]
    pub fee_tiers: Vec<String>,
}

impl PairMetadata {
    /// Create metadata with only the symbol fields set
    pub fn new(pair_key: &str, symbols: &str) -> Self {
        let (base, quote) = split_symbols(symbols);
        Self {
            pair_key: pair_key.to_string(),
            symbols: symbols.to_string(),
            base_symbol: base,
            quote_symbol: quote,
            base_address: None,
            quote_address: None,
            dex_id: None,
            fee_tiers: Vec::new(),
        }
    }

    pub fn with_addresses(mut self, base: &str, quote: &str) -> Self {
        self.base_address = Some(base.to_string());
        self.quote_address = Some(quote.to_string());
        self
    }

    pub fn with_dex(mut self, dex_id: &str) -> Self {
        self.dex_id = Some(dex_id.to_string());
        self
    }

    pub fn with_fee_tiers<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fee_tiers = tiers.into_iter().map(Into::into).collect();
        self
    }

    /// Fill in fields that older snapshots may have left empty
    pub(crate) fn normalized(mut self) -> Self {
        if self.symbols.trim().is_empty() {
            self.symbols = self.pair_key.clone();
        }
        self
    }
}

/// Split "BASE/QUOTE" into its parts; quote is empty when there is no slash
pub fn split_symbols(symbols: &str) -> (String, String) {
    match symbols.split_once('/') {
        Some((base, quote)) => (base.trim().to_string(), quote.trim().to_string()),
        None => (symbols.trim().to_string(), String::new()),
    }
}
