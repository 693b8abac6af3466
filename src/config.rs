//! Engine configuration.
//!
//! Layering: compiled defaults -> optional TOML file -> environment
//! overrides (`UPDOWN_*`). The file schema is a flat set of the knobs that
//! actually get tuned in operation; everything else keeps its default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::market::stream::StreamConfig;
use crate::market::user_stream::{ApiCredentials, UserStreamConfig};
use crate::session::scheduler::SchedulerConfig;
use crate::strategy::pair_lock::PairLockConfig;
use crate::strategy::win_bet::WinBetConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cycle slug prefix including the timeframe segment.
    pub slug_prefix: String,
    pub market_ws_url: String,
    pub user_ws_url: String,
    pub metadata_base_url: String,
    /// Paper mode: synthetic metadata + simulated venue, no credentials.
    pub paper: bool,
    pub credentials: Option<ApiCredentials>,
    pub executor_queue: usize,
    pub enable_pair_lock: bool,
    pub enable_win_bet: bool,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
    pub user_stream: UserStreamConfig,
    pub pair_lock: PairLockConfig,
    pub win_bet: WinBetConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slug_prefix: "btc-updown-15m".to_string(),
            market_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            user_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            metadata_base_url: "https://clob.polymarket.com".to_string(),
            paper: true,
            credentials: None,
            executor_queue: 1024,
            enable_pair_lock: true,
            enable_win_bet: true,
            scheduler: SchedulerConfig::default(),
            stream: StreamConfig::default(),
            user_stream: UserStreamConfig::default(),
            pair_lock: PairLockConfig::default(),
            win_bet: WinBetConfig::default(),
        }
    }
}

/// Flat TOML overlay. Absent keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub slug_prefix: Option<String>,
    pub market_ws_url: Option<String>,
    pub user_ws_url: Option<String>,
    pub metadata_base_url: Option<String>,
    pub paper: Option<bool>,
    pub executor_queue: Option<usize>,
    pub enable_pair_lock: Option<bool>,
    pub enable_win_bet: Option<bool>,
    pub max_spread_cents: Option<i64>,
    pub reconnect_cooldown_secs: Option<u64>,

    // Pair-lock knobs.
    pub profit_target_cents: Option<i64>,
    pub pair_order_size: Option<f64>,
    pub pair_max_trades_per_cycle: Option<u32>,
    pub pair_budget_usd: Option<f64>,
    pub pair_on_fail: Option<String>,

    // Win-bet knobs.
    pub min_velocity_cents_per_sec: Option<f64>,
    pub min_move_cents: Option<i64>,
    pub entry_size: Option<f64>,
    pub hedge_offset_cents: Option<i64>,
    pub min_quality_score: Option<i64>,
    pub max_acceptable_loss_cents: Option<i64>,
}

impl EngineConfig {
    /// Defaults, then the TOML file (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            let raw: RawConfig = toml::from_str(&text)
                .with_context(|| format!("parse config {}", path.display()))?;
            config.apply(raw);
        }
        config.apply_env();
        config.finish();
        Ok(config)
    }

    pub fn apply(&mut self, raw: RawConfig) {
        if let Some(v) = raw.slug_prefix {
            self.slug_prefix = v;
        }
        if let Some(v) = raw.market_ws_url {
            self.market_ws_url = v;
        }
        if let Some(v) = raw.user_ws_url {
            self.user_ws_url = v;
        }
        if let Some(v) = raw.metadata_base_url {
            self.metadata_base_url = v;
        }
        if let Some(v) = raw.paper {
            self.paper = v;
        }
        if let Some(v) = raw.executor_queue {
            self.executor_queue = v.max(1024);
        }
        if let Some(v) = raw.enable_pair_lock {
            self.enable_pair_lock = v;
        }
        if let Some(v) = raw.enable_win_bet {
            self.enable_win_bet = v;
        }
        if let Some(v) = raw.max_spread_cents {
            self.stream.max_spread_cents = v;
        }
        if let Some(v) = raw.reconnect_cooldown_secs {
            self.stream.reconnect_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = raw.profit_target_cents {
            self.pair_lock.profit_target_cents = v;
        }
        if let Some(v) = raw.pair_order_size {
            self.pair_lock.order_size = v;
        }
        if let Some(v) = raw.pair_max_trades_per_cycle {
            self.pair_lock.max_trades_per_cycle = v;
        }
        if let Some(v) = raw.pair_budget_usd {
            self.pair_lock.budget_usd = v;
        }
        if let Some(v) = raw.pair_on_fail {
            self.pair_lock.on_fail = parse_on_fail(&v).unwrap_or(self.pair_lock.on_fail);
        }
        if let Some(v) = raw.min_velocity_cents_per_sec {
            self.win_bet.min_velocity_cents_per_sec = v;
        }
        if let Some(v) = raw.min_move_cents {
            self.win_bet.min_move_cents = v;
        }
        if let Some(v) = raw.entry_size {
            self.win_bet.entry_size = v;
        }
        if let Some(v) = raw.hedge_offset_cents {
            self.win_bet.hedge_offset_cents = v;
        }
        if let Some(v) = raw.min_quality_score {
            self.win_bet.min_quality_score = v;
        }
        if let Some(v) = raw.max_acceptable_loss_cents {
            self.win_bet.max_acceptable_loss_cents = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("UPDOWN_SLUG_PREFIX") {
            self.slug_prefix = v;
        }
        if let Ok(v) = std::env::var("UPDOWN_MARKET_WS_URL") {
            self.market_ws_url = v;
        }
        if let Ok(v) = std::env::var("UPDOWN_USER_WS_URL") {
            self.user_ws_url = v;
        }
        if let Ok(v) = std::env::var("UPDOWN_METADATA_URL") {
            self.metadata_base_url = v;
        }
        if let Ok(v) = std::env::var("UPDOWN_PAPER") {
            self.paper = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Ok(v) = std::env::var("UPDOWN_PROFIT_TARGET_CENTS") {
            self.pair_lock.profit_target_cents =
                v.parse().unwrap_or(self.pair_lock.profit_target_cents);
        }
        if let Ok(v) = std::env::var("UPDOWN_MAX_SPREAD_CENTS") {
            self.stream.max_spread_cents = v.parse().unwrap_or(self.stream.max_spread_cents);
        }
        let apikey = std::env::var("UPDOWN_APIKEY").ok();
        let secret = std::env::var("UPDOWN_SECRET").ok();
        let passphrase = std::env::var("UPDOWN_PASSPHRASE").ok();
        if let (Some(apikey), Some(secret), Some(passphrase)) = (apikey, secret, passphrase) {
            self.credentials = Some(ApiCredentials {
                apikey,
                secret,
                passphrase,
            });
        }
    }

    /// Propagate top-level values into the sub-configs that carry copies.
    fn finish(&mut self) {
        self.scheduler.slug_prefix = self.slug_prefix.clone();
        self.stream.url = self.market_ws_url.clone();
        self.user_stream.url = self.user_ws_url.clone();
    }
}

fn parse_on_fail(s: &str) -> Option<crate::strategy::pair_lock::OnFailPolicy> {
    use crate::strategy::pair_lock::OnFailPolicy;
    match s.to_ascii_lowercase().as_str() {
        "pause" => Some(OnFailPolicy::Pause),
        "cancel_pause" => Some(OnFailPolicy::CancelPause),
        "flatten_pause" => Some(OnFailPolicy::FlattenPause),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::pair_lock::OnFailPolicy;

    #[test]
    fn test_defaults_are_coherent() {
        let mut cfg = EngineConfig::default();
        cfg.finish();
        assert_eq!(cfg.scheduler.slug_prefix, "btc-updown-15m");
        assert_eq!(cfg.scheduler.timeframe_secs(), 900);
        assert!(cfg.paper);
        assert!(cfg.executor_queue >= 1024);
    }

    #[test]
    fn test_toml_overlay() {
        let raw: RawConfig = toml::from_str(
            r#"
            slug_prefix = "eth-updown-1h"
            paper = false
            profit_target_cents = 7
            pair_on_fail = "flatten_pause"
            min_velocity_cents_per_sec = 0.5
            max_spread_cents = 6
            "#,
        )
        .unwrap();
        let mut cfg = EngineConfig::default();
        cfg.apply(raw);
        cfg.finish();

        assert_eq!(cfg.slug_prefix, "eth-updown-1h");
        assert_eq!(cfg.scheduler.timeframe_secs(), 3600);
        assert!(!cfg.paper);
        assert_eq!(cfg.pair_lock.profit_target_cents, 7);
        assert_eq!(cfg.pair_lock.on_fail, OnFailPolicy::FlattenPause);
        assert!((cfg.win_bet.min_velocity_cents_per_sec - 0.5).abs() < 1e-12);
        assert_eq!(cfg.stream.max_spread_cents, 6);
        // Untouched keys keep defaults.
        assert_eq!(cfg.win_bet.hedge_offset_cents, 1);
    }

    #[test]
    fn test_unknown_on_fail_keeps_default() {
        let mut cfg = EngineConfig::default();
        cfg.apply(RawConfig {
            pair_on_fail: Some("explode".to_string()),
            ..RawConfig::default()
        });
        assert_eq!(cfg.pair_lock.on_fail, OnFailPolicy::Pause);
    }
}
