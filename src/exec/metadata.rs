//! Cycle market metadata fetch.
//!
//! One HTTP call per cycle rotation resolves a slug into its Market
//! descriptor (condition id + paired asset ids). Retry with exponential
//! backoff; the scheduler's fail-safe pause handles persistent failure.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::models::Market;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait MarketInfoFetcher: Send + Sync {
    async fn fetch_market_info(&self, slug: &str) -> Result<Market>;
}

// ============================================================================
// HTTP fetcher
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireMarket {
    #[serde(default)]
    slug: String,
    #[serde(rename = "conditionId", alias = "condition_id")]
    condition_id: String,
    tokens: Vec<WireToken>,
}

#[derive(Debug, Deserialize)]
struct WireToken {
    #[serde(rename = "tokenId", alias = "token_id")]
    token_id: String,
    outcome: String,
}

pub struct HttpMarketInfoFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMarketInfoFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn fetch_once(&self, slug: &str) -> Result<Market> {
        let url = format!("{}/markets", self.base_url);
        let resp = timeout(
            REQUEST_TIMEOUT,
            self.client.get(&url).query(&[("slug", slug)]).send(),
        )
        .await
        .context("metadata request timeout")?
        .context("metadata request failed")?;

        if !resp.status().is_success() {
            bail!("metadata request status {}", resp.status());
        }

        let markets: Vec<WireMarket> = resp.json().await.context("parse metadata response")?;
        let wire = markets
            .into_iter()
            .find(|m| m.slug.is_empty() || m.slug == slug)
            .with_context(|| format!("no market for slug {slug}"))?;

        let yes = wire
            .tokens
            .iter()
            .find(|t| matches!(t.outcome.to_ascii_lowercase().as_str(), "up" | "yes"))
            .with_context(|| format!("no up/yes token for {slug}"))?;
        let no = wire
            .tokens
            .iter()
            .find(|t| matches!(t.outcome.to_ascii_lowercase().as_str(), "down" | "no"))
            .with_context(|| format!("no down/no token for {slug}"))?;
        if yes.token_id == no.token_id {
            bail!("degenerate market {slug}: identical asset ids");
        }

        Ok(Market::new(
            slug,
            wire.condition_id,
            yes.token_id.clone(),
            no.token_id.clone(),
        ))
    }
}

#[async_trait]
impl MarketInfoFetcher for HttpMarketInfoFetcher {
    async fn fetch_market_info(&self, slug: &str) -> Result<Market> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_err = None;
        for attempt in 1..=MAX_RETRIES {
            match self.fetch_once(slug).await {
                Ok(market) => return Ok(market),
                Err(e) => {
                    warn!(slug, attempt, error = %e, "metadata_fetch_failed");
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        sleep(Duration::from_millis(backoff)).await;
                        backoff = (backoff * 2).min(5_000);
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt"))
    }
}

// ============================================================================
// Synthetic fetchers (paper mode and tests)
// ============================================================================

/// Derives deterministic asset ids from the slug itself. Paper mode uses
/// this so the engine runs without any upstream.
pub struct SyntheticMarketFetcher;

#[async_trait]
impl MarketInfoFetcher for SyntheticMarketFetcher {
    async fn fetch_market_info(&self, slug: &str) -> Result<Market> {
        debug!(slug, "synthetic_market");
        Ok(Market::new(
            slug,
            format!("paper-{slug}"),
            format!("{slug}-up"),
            format!("{slug}-down"),
        ))
    }
}

/// Scripted fetcher: preloaded slug -> market map plus a failure switch,
/// for scheduler rotation and pause tests.
#[derive(Default)]
pub struct StaticMarketFetcher {
    markets: Mutex<HashMap<String, Market>>,
    fail: AtomicBool,
    pub calls: AtomicU64,
}

impl StaticMarketFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, market: Market) {
        self.markets.lock().insert(market.slug.clone(), market);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketInfoFetcher for StaticMarketFetcher {
    async fn fetch_market_info(&self, slug: &str) -> Result<Market> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("scripted metadata failure for {slug}");
        }
        self.markets
            .lock()
            .get(slug)
            .cloned()
            .with_context(|| format!("no scripted market for {slug}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_fetcher_shapes_market() {
        let m = SyntheticMarketFetcher
            .fetch_market_info("btc-updown-15m-1766394900")
            .await
            .unwrap();
        assert_eq!(m.timestamp, 1766394900);
        assert_eq!(m.duration_secs, 900);
        assert_ne!(m.yes_asset_id, m.no_asset_id);
        assert!(m.yes_asset_id.ends_with("-up"));
    }

    #[tokio::test]
    async fn test_static_fetcher_scripting() {
        let f = StaticMarketFetcher::new();
        let slug = "btc-updown-15m-1766394900";
        f.insert(Market::new(slug, "c", "y", "n"));

        assert!(f.fetch_market_info(slug).await.is_ok());
        assert!(f.fetch_market_info("other").await.is_err());

        f.set_failing(true);
        assert!(f.fetch_market_info(slug).await.is_err());
        f.set_failing(false);
        assert!(f.fetch_market_info(slug).await.is_ok());
        assert_eq!(f.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_wire_market_parsing() {
        let raw = r#"[{
            "slug": "btc-updown-15m-1766394900",
            "conditionId": "0xabc",
            "tokens": [
                {"tokenId": "111", "outcome": "Up"},
                {"tokenId": "222", "outcome": "Down"}
            ]
        }]"#;
        let markets: Vec<WireMarket> = serde_json::from_str(raw).unwrap();
        assert_eq!(markets[0].condition_id, "0xabc");
        assert_eq!(markets[0].tokens.len(), 2);
    }
}
