//! Core vocabulary for the up/down cycle trading engine.
//!
//! Prices are integer cents in [0, 100] (probability x 100). The wire carries
//! decimal dollar strings ("0.48"); everything past the parse boundary works
//! in cents. 0 and 100 are sentinels and never valid top-of-book.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Fallback cycle duration when the slug carries no timeframe segment.
pub const DEFAULT_CYCLE_SECS: i64 = 900;

/// Size fields in packed book words are shares x 10_000.
pub const SIZE_SCALE: f64 = 10_000.0;

/// Wall-clock milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Wall-clock seconds.
#[inline]
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

// ============================================================================
// Tokens
// ============================================================================

/// One side of a paired binary market (UP/YES vs DOWN/NO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Up,
    Down,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Up => "up",
            TokenKind::Down => "down",
        }
    }

    /// The other leg of the pair.
    #[inline]
    pub fn complement(&self) -> TokenKind {
        match self {
            TokenKind::Up => TokenKind::Down,
            TokenKind::Down => TokenKind::Up,
        }
    }

    /// Index used by per-token slot arrays (Up first for deterministic dispatch).
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            TokenKind::Up => 0,
            TokenKind::Down => 1,
        }
    }

    pub const BOTH: [TokenKind; 2] = [TokenKind::Up, TokenKind::Down];
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Market descriptor
// ============================================================================

/// Immutable descriptor of one trading cycle. Created by the scheduler,
/// shared as `Arc<Market>`, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub slug: String,
    pub condition_id: String,
    pub yes_asset_id: String,
    pub no_asset_id: String,
    /// Cycle start, unix seconds. Authoritative cycle identity.
    pub timestamp: i64,
    /// Cycle length, derived from the slug timeframe segment.
    pub duration_secs: i64,
}

impl Market {
    pub fn new(
        slug: impl Into<String>,
        condition_id: impl Into<String>,
        yes_asset_id: impl Into<String>,
        no_asset_id: impl Into<String>,
    ) -> Self {
        let slug = slug.into();
        let timestamp = slug_timestamp(&slug).unwrap_or(0);
        let duration_secs = slug_timeframe_secs(&slug);
        Self {
            slug,
            condition_id: condition_id.into(),
            yes_asset_id: yes_asset_id.into(),
            no_asset_id: no_asset_id.into(),
            timestamp,
            duration_secs,
        }
    }

    #[inline]
    pub fn cycle_end(&self) -> i64 {
        self.timestamp + self.duration_secs
    }

    /// Seconds remaining in the cycle at `now_secs` (clamped at zero).
    #[inline]
    pub fn seconds_remaining(&self, now_secs: i64) -> i64 {
        (self.cycle_end() - now_secs).max(0)
    }

    pub fn asset_id(&self, token: TokenKind) -> &str {
        match token {
            TokenKind::Up => &self.yes_asset_id,
            TokenKind::Down => &self.no_asset_id,
        }
    }

    pub fn token_for_asset(&self, asset_id: &str) -> Option<TokenKind> {
        if asset_id == self.yes_asset_id {
            Some(TokenKind::Up)
        } else if asset_id == self.no_asset_id {
            Some(TokenKind::Down)
        } else {
            None
        }
    }

    /// Cycle identity comparison: timestamp first, slug as fallback when
    /// either side carries no timestamp.
    pub fn same_cycle(&self, other: &Market) -> bool {
        if self.timestamp > 0 && other.timestamp > 0 {
            self.timestamp == other.timestamp
        } else {
            self.slug == other.slug
        }
    }
}

// ============================================================================
// Slug grammar: <prefix>-<timeframe>-<unix_seconds>
// ============================================================================

/// Trailing unix-seconds segment of a cycle slug.
pub fn slug_timestamp(slug: &str) -> Option<i64> {
    let last = slug.rsplit('-').next()?;
    let ts: i64 = last.parse().ok()?;
    // A timeframe segment ("15m") also fails the parse; tiny integers are
    // not plausible cycle starts.
    if ts > 1_000_000_000 {
        Some(ts)
    } else {
        None
    }
}

/// Cycle duration from the `<timeframe>` slug segment (`15m`, `1h`, `4h`, ...).
/// Falls back to 15 minutes when no segment parses.
pub fn slug_timeframe_secs(slug: &str) -> i64 {
    for seg in slug.split('-') {
        if let Some(secs) = parse_timeframe(seg) {
            return secs;
        }
    }
    DEFAULT_CYCLE_SECS
}

/// `"15m"` -> 900, `"1h"` -> 3600. Anything else -> None.
pub fn parse_timeframe(seg: &str) -> Option<i64> {
    if seg.len() < 2 {
        return None;
    }
    let (num, unit) = seg.split_at(seg.len() - 1);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    match unit {
        "m" => Some(n * 60),
        "h" => Some(n * 3600),
        _ => None,
    }
}

/// UTC-aligned start of the period containing `now_secs`.
#[inline]
pub fn current_period_start_unix(now_secs: i64, duration_secs: i64) -> i64 {
    if duration_secs <= 0 {
        return now_secs;
    }
    (now_secs / duration_secs) * duration_secs
}

/// Build a cycle slug from a prefix that already carries the timeframe
/// segment (e.g. `btc-updown-15m`) and a period start.
pub fn build_slug(prefix: &str, period_start: i64) -> String {
    format!("{}-{}", prefix, period_start)
}

// ============================================================================
// Price / size parsing
// ============================================================================

/// Parse a wire decimal dollar string ("0.48") into cents, accepting only
/// the open interval (0, 100).
pub fn parse_price_cents(s: &str) -> Option<i64> {
    let v: f64 = s.trim().parse().ok()?;
    if !v.is_finite() {
        return None;
    }
    let cents = (v * 100.0).round() as i64;
    if cents > 0 && cents < 100 {
        Some(cents)
    } else {
        None
    }
}

/// Cents back to the wire decimal form.
pub fn cents_to_decimal(cents: i64) -> String {
    format!("{:.2}", cents as f64 / 100.0)
}

/// Parse a wire size string into shares.
pub fn parse_size(s: &str) -> Option<f64> {
    let v: f64 = s.trim().parse().ok()?;
    if v.is_finite() && v >= 0.0 {
        Some(v)
    } else {
        None
    }
}

/// Shares -> packed u32 (x 10_000, saturating).
#[inline]
pub fn scale_size(shares: f64) -> u32 {
    if shares <= 0.0 {
        return 0;
    }
    (shares * SIZE_SCALE).round().min(u32::MAX as f64) as u32
}

/// Packed u32 -> shares.
#[inline]
pub fn unscale_size(scaled: u32) -> f64 {
    scaled as f64 / SIZE_SCALE
}

// ============================================================================
// Events
// ============================================================================

/// Top-of-book mid move for one token, published by the market stream after
/// the quality gate. Carries no old price; consumers keep their own history.
#[derive(Debug, Clone)]
pub struct PriceChangedEvent {
    pub market: Arc<Market>,
    pub token: TokenKind,
    pub price_cents: i64,
    pub timestamp_ms: i64,
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FAK takes liquidity and cancels the remainder; GTC rests as a maker quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Fak,
    Gtc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Fak => "FAK",
            OrderType::Gtc => "GTC",
        }
    }
}

/// Status lattice: Pending -> Open -> (Partial -> Filled) | Canceled | Failed.
/// Filled is terminal; fill application must stay idempotent because the
/// same fill may arrive via multiple channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Canceled,
    Failed,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Failed
        )
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::Partial
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Strategy-visible order projection. One Session owns every order whose
/// cycle matches its market (by slug or asset id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub market_slug: String,
    pub asset_id: String,
    pub token: Option<TokenKind>,
    pub side: Side,
    pub price_cents: i64,
    pub size: f64,
    pub filled_size: f64,
    pub filled_price_cents: Option<i64>,
    pub order_type: OrderType,
    pub is_entry: bool,
    pub hedge_order_id: Option<String>,
    /// Skip the pause check on placement (hedges must go out while risk-off).
    pub bypass_risk_off: bool,
    pub status: OrderStatus,
    pub created_at_ms: i64,
    pub filled_at_ms: Option<i64>,
}

impl Order {
    /// A fresh order request; the trading service assigns `order_id`.
    pub fn request(
        market_slug: impl Into<String>,
        asset_id: impl Into<String>,
        token: Option<TokenKind>,
        side: Side,
        price_cents: i64,
        size: f64,
        order_type: OrderType,
    ) -> Self {
        Self {
            order_id: String::new(),
            market_slug: market_slug.into(),
            asset_id: asset_id.into(),
            token,
            side,
            price_cents,
            size,
            filled_size: 0.0,
            filled_price_cents: None,
            order_type,
            is_entry: false,
            hedge_order_id: None,
            bypass_risk_off: false,
            status: OrderStatus::Pending,
            created_at_ms: now_ms(),
            filled_at_ms: None,
        }
    }

    pub fn entry(mut self) -> Self {
        self.is_entry = true;
        self
    }

    pub fn with_hedge(mut self, hedge_order_id: impl Into<String>) -> Self {
        self.hedge_order_id = Some(hedge_order_id.into());
        self
    }

    pub fn bypassing_risk_off(mut self) -> Self {
        self.bypass_risk_off = true;
        self
    }

    #[inline]
    pub fn remaining(&self) -> f64 {
        (self.size - self.filled_size).max(0.0)
    }

    #[inline]
    pub fn notional_usd(&self) -> f64 {
        self.size * self.price_cents as f64 / 100.0
    }
}

/// Fill confirmation from the user stream. Only MATCHED trades are surfaced;
/// lower statuses may still be retracted by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub trade_id: String,
    pub order_id: String,
    pub market_slug: String,
    pub asset_id: String,
    pub side: Side,
    pub price_cents: i64,
    pub size: f64,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_grammar() {
        let slug = "btc-updown-15m-1766394900";
        assert_eq!(slug_timestamp(slug), Some(1766394900));
        assert_eq!(slug_timeframe_secs(slug), 900);

        assert_eq!(slug_timeframe_secs("eth-updown-1h-1766394000"), 3600);
        assert_eq!(slug_timeframe_secs("eth-updown-4h-1766394000"), 4 * 3600);
        assert_eq!(slug_timeframe_secs("sol-updown-30m-1766394000"), 1800);

        // No timeframe segment: fallback 15m.
        assert_eq!(slug_timeframe_secs("mystery-market"), DEFAULT_CYCLE_SECS);
        assert_eq!(slug_timestamp("mystery-market"), None);
    }

    #[test]
    fn test_period_alignment() {
        let start = current_period_start_unix(1766394923, 900);
        assert_eq!(start, 1766394900);
        assert_eq!(start % 900, 0);
        assert_eq!(
            build_slug("btc-updown-15m", start),
            "btc-updown-15m-1766394900"
        );
    }

    #[test]
    fn test_market_identity() {
        let m = Market::new("btc-updown-15m-1766394900", "0xc0ffee", "yes-1", "no-1");
        assert_eq!(m.timestamp, 1766394900);
        assert_eq!(m.duration_secs, 900);
        assert_eq!(m.cycle_end(), 1766395800);
        assert_eq!(m.token_for_asset("yes-1"), Some(TokenKind::Up));
        assert_eq!(m.token_for_asset("no-1"), Some(TokenKind::Down));
        assert_eq!(m.token_for_asset("other"), None);
        assert_eq!(m.asset_id(TokenKind::Down), "no-1");

        let next = Market::new("btc-updown-15m-1766395800", "0xc0ffee", "yes-2", "no-2");
        assert!(!m.same_cycle(&next));
        assert!(m.same_cycle(&m.clone()));
    }

    #[test]
    fn test_price_parse_open_interval() {
        assert_eq!(parse_price_cents("0.48"), Some(48));
        assert_eq!(parse_price_cents("0.01"), Some(1));
        assert_eq!(parse_price_cents("0.995"), None); // rounds to 100
        assert_eq!(parse_price_cents("0"), None);
        assert_eq!(parse_price_cents("1.0"), None);
        assert_eq!(parse_price_cents("-0.2"), None);
        assert_eq!(parse_price_cents("nan"), None);
        assert_eq!(parse_price_cents("garbage"), None);
        assert_eq!(cents_to_decimal(48), "0.48");
    }

    #[test]
    fn test_size_scaling() {
        assert_eq!(scale_size(2.0), 20_000);
        assert_eq!(scale_size(0.0), 0);
        assert!((unscale_size(scale_size(13.37)) - 13.37).abs() < 1e-9);
        // Saturates instead of wrapping.
        assert_eq!(scale_size(1e12), u32::MAX);
    }

    #[test]
    fn test_status_lattice() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Open.is_live());
        assert!(OrderStatus::Partial.is_live());
        assert!(!OrderStatus::Pending.is_terminal());
    }

    #[test]
    fn test_order_builders() {
        let o = Order::request(
            "slug",
            "asset",
            Some(TokenKind::Up),
            Side::Buy,
            48,
            2.0,
            OrderType::Fak,
        )
        .entry()
        .bypassing_risk_off();
        assert!(o.is_entry);
        assert!(o.bypass_risk_off);
        assert_eq!(o.remaining(), 2.0);
        assert!((o.notional_usd() - 0.96).abs() < 1e-12);
    }
}
