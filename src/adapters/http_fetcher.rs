//! HTTP pair fetcher
//!
//! GETs a URL rendered from a template and turns the JSON body into a
//! snapshot payload.

use crate::config::FetcherConfig;
use crate::domain::{FetchResult, PairMetadata, Payload};
use crate::error::{Result, ScanError};
use crate::infra::PairFetcher;
use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct HttpPairFetcher {
    http: Client,
    url_template: String,
}

impl HttpPairFetcher {
    pub fn new(url_template: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pairscan/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url_template: url_template.to_string(),
        })
    }

    pub fn from_config(config: &FetcherConfig) -> Result<Self> {
        Self::new(&config.url_template, Duration::from_millis(config.timeout_ms))
    }

    /// Substitute pair fields into the template; absent fields render empty
    pub fn render_url(&self, pair: &PairMetadata) -> String {
        self.url_template
            .replace("{pair_key}", &pair.pair_key)
            .replace("{base_address}", pair.base_address.as_deref().unwrap_or(""))
            .replace("{quote_address}", pair.quote_address.as_deref().unwrap_or(""))
            .replace("{dex_id}", pair.dex_id.as_deref().unwrap_or(""))
    }
}

/// Objects are used as-is; any other JSON value is wrapped under `data`
fn into_payload(body: Value) -> Payload {
    match body {
        Value::Object(map) => map,
        other => {
            let mut payload = Payload::new();
            payload.insert("data".to_string(), other);
            payload
        }
    }
}

#[async_trait]
impl PairFetcher for HttpPairFetcher {
    async fn fetch(&self, pair: &PairMetadata) -> anyhow::Result<FetchResult> {
        let url = self.render_url(pair);
        debug!("Fetching {} from {}", pair.pair_key, url);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            bail!("GET {} failed: status={} body={}", url, status, text);
        }

        let body: Value = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON from {}", url))?;
        Ok(FetchResult::fresh(into_payload(body)))
    }
}
