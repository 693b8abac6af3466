//! Pre-trade market-quality scoring.
//!
//! A book is scored 0-100 by applying fixed deductions; `Tradable` means
//! complete and fresh with a score at or above the configured minimum. The
//! deduction rubric is the contract; the threshold is policy.

use serde::Serialize;

use crate::market::best_book::BestBookSnapshot;
use crate::models::TokenKind;

#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Snapshot older than this is stale for trading decisions.
    pub max_age_ms: i64,
    /// Spread above this (either side) is a wide-spread deduction.
    pub max_spread_cents: i64,
    /// |yes_mid + no_mid - 100| above this is a mirror-gap deduction.
    pub mirror_gap_cents: i64,
    /// Minimum score for `Tradable`.
    pub min_score: i64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 2_500,
            max_spread_cents: 10,
            mirror_gap_cents: 5,
            min_score: 60,
        }
    }
}

/// Deductions in rubric order. Penalties are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Deduction {
    IncompleteTop,
    CrossedYes,
    CrossedNo,
    WsPartial,
    WsStale,
    WideSpread,
    EffectivePriceFailed,
    MirrorGap,
    RestFailed,
}

impl Deduction {
    pub fn penalty(&self) -> i64 {
        match self {
            Deduction::IncompleteTop => 50,
            Deduction::CrossedYes | Deduction::CrossedNo => 40,
            Deduction::WsPartial => 35,
            Deduction::WsStale => 25,
            Deduction::WideSpread => 20,
            Deduction::EffectivePriceFailed => 20,
            Deduction::MirrorGap => 10,
            Deduction::RestFailed => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Deduction::IncompleteTop => "incomplete_top",
            Deduction::CrossedYes => "crossed_yes",
            Deduction::CrossedNo => "crossed_no",
            Deduction::WsPartial => "ws_partial",
            Deduction::WsStale => "ws_stale",
            Deduction::WideSpread => "wide_spread",
            Deduction::EffectivePriceFailed => "effective_price_failed",
            Deduction::MirrorGap => "mirror_gap",
            Deduction::RestFailed => "rest_failed",
        }
    }
}

/// Scoring result handed back to strategies.
#[derive(Debug, Clone)]
pub struct MarketQuality {
    pub score: i64,
    pub complete: bool,
    pub fresh: bool,
    pub deductions: Vec<Deduction>,
    pub snapshot: BestBookSnapshot,
}

impl MarketQuality {
    /// Tradable iff complete AND fresh AND score clears the threshold.
    pub fn tradable(&self, min_score: i64) -> bool {
        self.complete && self.fresh && self.score >= min_score
    }

    pub fn deduction_names(&self) -> Vec<&'static str> {
        self.deductions.iter().map(|d| d.as_str()).collect()
    }
}

/// Score one snapshot. `rest_failed` is set by callers whose REST fallback
/// errored while trying to corroborate a stale or partial book.
pub fn evaluate(
    snapshot: &BestBookSnapshot,
    now_ms: i64,
    cfg: &QualityConfig,
    rest_failed: bool,
) -> MarketQuality {
    let mut deductions = Vec::new();

    let complete = snapshot.complete();
    let any_side = snapshot.yes_bid > 0
        || snapshot.yes_ask > 0
        || snapshot.no_bid > 0
        || snapshot.no_ask > 0;

    if !complete {
        deductions.push(Deduction::IncompleteTop);
        if any_side {
            deductions.push(Deduction::WsPartial);
        }
    }

    if snapshot.is_crossed(TokenKind::Up) {
        deductions.push(Deduction::CrossedYes);
    }
    if snapshot.is_crossed(TokenKind::Down) {
        deductions.push(Deduction::CrossedNo);
    }

    let fresh = snapshot.updated_at_ms > 0 && snapshot.age_ms(now_ms) <= cfg.max_age_ms;
    if !fresh {
        deductions.push(Deduction::WsStale);
    }

    let wide = TokenKind::BOTH.iter().any(|t| {
        snapshot
            .spread_cents(*t)
            .map(|s| s > cfg.max_spread_cents)
            .unwrap_or(false)
    });
    if wide {
        deductions.push(Deduction::WideSpread);
    }

    // A priced level with no resting size cannot produce an effective
    // taker price estimate.
    let effective_failed = (snapshot.yes_ask > 0 && snapshot.yes_ask_size <= 0.0)
        || (snapshot.no_ask > 0 && snapshot.no_ask_size <= 0.0);
    if effective_failed {
        deductions.push(Deduction::EffectivePriceFailed);
    }

    if let (Some(yes_mid), Some(no_mid)) = (
        snapshot.mid_cents(TokenKind::Up),
        snapshot.mid_cents(TokenKind::Down),
    ) {
        if (yes_mid + no_mid - 100).abs() > cfg.mirror_gap_cents {
            deductions.push(Deduction::MirrorGap);
        }
    }

    if rest_failed {
        deductions.push(Deduction::RestFailed);
    }

    let score = (100 - deductions.iter().map(|d| d.penalty()).sum::<i64>()).max(0);

    MarketQuality {
        score,
        complete,
        fresh,
        deductions,
        snapshot: *snapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::best_book::AtomicBestBook;
    use crate::models::{now_ms, scale_size};

    fn good_book() -> BestBookSnapshot {
        let book = AtomicBestBook::new();
        book.update_token(TokenKind::Up, 48, 52, scale_size(10.0), scale_size(10.0));
        book.update_token(TokenKind::Down, 47, 51, scale_size(10.0), scale_size(10.0));
        book.load()
    }

    #[test]
    fn test_clean_book_scores_100() {
        let q = evaluate(&good_book(), now_ms(), &QualityConfig::default(), false);
        assert_eq!(q.score, 100);
        assert!(q.complete && q.fresh);
        assert!(q.tradable(60));
        assert!(q.deductions.is_empty());
    }

    #[test]
    fn test_stale_book_not_tradable() {
        let mut snap = good_book();
        snap.updated_at_ms = now_ms() - 60_000;
        let q = evaluate(&snap, now_ms(), &QualityConfig::default(), false);
        assert!(!q.fresh);
        assert_eq!(q.score, 75);
        assert!(!q.tradable(60)); // freshness gates regardless of score
        assert!(q.deductions.contains(&Deduction::WsStale));
    }

    #[test]
    fn test_partial_book() {
        let book = AtomicBestBook::new();
        book.update_token(TokenKind::Up, 48, 52, scale_size(1.0), scale_size(1.0));
        let q = evaluate(&book.load(), now_ms(), &QualityConfig::default(), false);
        assert!(!q.complete);
        assert!(q.deductions.contains(&Deduction::IncompleteTop));
        assert!(q.deductions.contains(&Deduction::WsPartial));
        assert!(!q.tradable(60));
    }

    #[test]
    fn test_crossed_and_wide() {
        let mut snap = good_book();
        snap.yes_bid = 60; // crossed vs ask 52
        let q = evaluate(&snap, now_ms(), &QualityConfig::default(), false);
        assert!(q.deductions.contains(&Deduction::CrossedYes));

        let mut snap = good_book();
        snap.no_ask = 70; // spread 23 on the down side, and mirror broken
        let q = evaluate(&snap, now_ms(), &QualityConfig::default(), false);
        assert!(q.deductions.contains(&Deduction::WideSpread));
        assert!(q.deductions.contains(&Deduction::MirrorGap));
        assert!(!q.tradable(60));
    }

    #[test]
    fn test_effective_price_and_rest_failure() {
        let mut snap = good_book();
        snap.yes_ask_size = 0.0;
        let q = evaluate(&snap, now_ms(), &QualityConfig::default(), true);
        assert!(q.deductions.contains(&Deduction::EffectivePriceFailed));
        assert!(q.deductions.contains(&Deduction::RestFailed));
        assert_eq!(q.score, 100 - 20 - 15);
        assert_eq!(
            q.deduction_names(),
            vec!["effective_price_failed", "rest_failed"]
        );
    }
}
