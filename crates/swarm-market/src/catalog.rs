//! Market catalog client.
//!
//! Thin typed wrapper over the catalog service's `GET /markets` endpoint.
//! Responses are advisory; discovery failures are retried on the next scan.

use std::time::Duration;

use chrono::DateTime;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use swarm_common::MarketPair;

use crate::types::MarketDescriptor;

/// Errors from the catalog client.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid market data: {0}")]
    InvalidData(String),
}

/// Configuration for the catalog client.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Catalog base URL.
    pub base_url: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP client for the market catalog service.
pub struct CatalogClient {
    config: CatalogConfig,
    client: Client,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Fetch up to `limit` open markets.
    pub async fn open_markets(&self, limit: usize) -> Result<Vec<MarketDescriptor>, CatalogError> {
        let url = format!("{}/markets", self.config.base_url.trim_end_matches('/'));
        let limit = limit.to_string();
        let markets: Vec<MarketDescriptor> = self
            .client
            .get(&url)
            .query(&[("closed", "false"), ("limit", limit.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(count = markets.len(), "fetched market catalog");
        Ok(markets)
    }

    /// Fetch open markets and keep only well-formed binary YES/NO pairs.
    pub async fn open_pairs(&self, limit: usize) -> Result<Vec<MarketPair>, CatalogError> {
        let markets = self.open_markets(limit).await?;
        Ok(markets.iter().filter_map(to_pair).collect())
    }
}

/// Extract a YES/NO token pair from a market descriptor, if it has exactly
/// one token per outcome.
pub fn to_pair(market: &MarketDescriptor) -> Option<MarketPair> {
    let mut yes = None;
    let mut no = None;
    for token in &market.tokens {
        match token.outcome.to_ascii_lowercase().as_str() {
            "yes" => yes = Some(token.token_id.clone()),
            "no" => no = Some(token.token_id.clone()),
            _ => return None,
        }
    }
    let (yes_token_id, no_token_id) = (yes?, no?);
    let end_date = market
        .end_date_iso
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.to_utc());
    Some(MarketPair {
        market_id: market.id.clone(),
        question: market.question.clone().unwrap_or_default(),
        yes_token_id,
        no_token_id,
        end_date,
    })
}
