//! Per-market price/spread stability window.
//!
//! Entries are refused while the recent book is jumpy: either side's price
//! amplitude over the window, or a robust (median-based, IQR-filtered)
//! spread volatility, above the configured percentages. Samples whose own
//! spread is already absurd are filtered at ingestion so one bad snapshot
//! cannot poison the window.

use statrs::statistics::{Data, OrderStatistics};
use std::collections::VecDeque;

use crate::market::best_book::BestBookSnapshot;
use crate::models::TokenKind;

/// Hard cap on retained samples regardless of window length.
const MAX_SAMPLES: usize = 512;

#[derive(Debug, Clone)]
pub struct StabilityConfig {
    pub window_secs: i64,
    /// Max (amplitude / min) * 100 over the window, per side.
    pub max_price_change_percent: f64,
    /// Max robust spread volatility percent.
    pub max_spread_volatility_percent: f64,
    /// Ingestion filter: drop samples whose own spread exceeds this.
    pub max_spread_filter_cents: i64,
    /// Below this many samples the window has no verdict and blocks entries.
    pub min_samples: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            max_price_change_percent: 12.0,
            max_spread_volatility_percent: 40.0,
            max_spread_filter_cents: 15,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StabilitySample {
    ts_ms: i64,
    yes_mid: f64,
    no_mid: f64,
    yes_spread: f64,
    no_spread: f64,
}

#[derive(Debug, Clone)]
pub struct StabilityVerdict {
    pub stable: bool,
    pub reason: Option<&'static str>,
    pub price_amplitude_percent: f64,
    pub spread_volatility_percent: f64,
    pub samples: usize,
}

#[derive(Debug)]
pub struct StabilityWindow {
    cfg: StabilityConfig,
    samples: VecDeque<StabilitySample>,
}

impl StabilityWindow {
    pub fn new(cfg: StabilityConfig) -> Self {
        Self {
            cfg,
            samples: VecDeque::with_capacity(64),
        }
    }

    /// Ingest one snapshot. Incomplete books and books whose own spread
    /// exceeds the point filter are dropped.
    pub fn observe(&mut self, snapshot: &BestBookSnapshot, now_ms: i64) {
        let (Some(yes_mid), Some(no_mid)) = (
            snapshot.mid_cents(TokenKind::Up),
            snapshot.mid_cents(TokenKind::Down),
        ) else {
            return;
        };
        let yes_spread = snapshot.spread_cents(TokenKind::Up).unwrap_or(i64::MAX);
        let no_spread = snapshot.spread_cents(TokenKind::Down).unwrap_or(i64::MAX);
        if yes_spread > self.cfg.max_spread_filter_cents
            || no_spread > self.cfg.max_spread_filter_cents
        {
            return;
        }

        self.samples.push_back(StabilitySample {
            ts_ms: now_ms,
            yes_mid: yes_mid as f64,
            no_mid: no_mid as f64,
            yes_spread: yes_spread as f64,
            no_spread: no_spread as f64,
        });
        self.evict(now_ms);
    }

    /// Reset on cycle rotation.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn evict(&mut self, now_ms: i64) {
        let horizon = now_ms - self.cfg.window_secs * 1000;
        while let Some(front) = self.samples.front() {
            if front.ts_ms < horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Judge the window. No verdict (too few samples) blocks entries.
    pub fn assess(&mut self, now_ms: i64) -> StabilityVerdict {
        self.evict(now_ms);

        if self.samples.len() < self.cfg.min_samples {
            return StabilityVerdict {
                stable: false,
                reason: Some("insufficient_samples"),
                price_amplitude_percent: 0.0,
                spread_volatility_percent: 0.0,
                samples: self.samples.len(),
            };
        }

        let amplitude = f64::max(
            amplitude_percent(self.samples.iter().map(|s| s.yes_mid)),
            amplitude_percent(self.samples.iter().map(|s| s.no_mid)),
        );

        let spreads: Vec<f64> = self
            .samples
            .iter()
            .flat_map(|s| [s.yes_spread, s.no_spread])
            .collect();
        let volatility = robust_spread_volatility_percent(spreads);

        let (stable, reason) = if amplitude > self.cfg.max_price_change_percent {
            (false, Some("price_amplitude"))
        } else if volatility > self.cfg.max_spread_volatility_percent {
            (false, Some("spread_volatility"))
        } else {
            (true, None)
        };

        StabilityVerdict {
            stable,
            reason,
            price_amplitude_percent: amplitude,
            spread_volatility_percent: volatility,
            samples: self.samples.len(),
        }
    }
}

fn amplitude_percent(values: impl Iterator<Item = f64>) -> f64 {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut n = 0usize;
    for v in values {
        min = min.min(v);
        max = max.max(v);
        n += 1;
    }
    if n == 0 || min <= 0.0 {
        return 0.0;
    }
    (max - min) / min * 100.0
}

/// Median-based volatility over IQR-filtered spreads: outliers beyond
/// 1.5 * IQR are discarded, then median absolute deviation relative to the
/// median is reported as a percentage.
fn robust_spread_volatility_percent(spreads: Vec<f64>) -> f64 {
    if spreads.len() < 2 {
        return 0.0;
    }
    let mut data = Data::new(spreads.clone());
    let q1 = data.lower_quartile();
    let q3 = data.upper_quartile();
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;

    let kept: Vec<f64> = spreads.into_iter().filter(|s| *s >= lo && *s <= hi).collect();
    if kept.len() < 2 {
        return 0.0;
    }
    let median = median_of(kept.clone());
    if median <= 0.0 {
        return 0.0;
    }
    let deviations: Vec<f64> = kept.iter().map(|s| (s - median).abs()).collect();
    let mad = median_of(deviations);
    mad / median * 100.0
}

fn median_of(values: Vec<f64>) -> f64 {
    let mut data = Data::new(values);
    data.median()
}
