//! Per-direction sliding-window price velocity.
//!
//! Owned by one strategy's single-threaded loop, so no locking. Samples
//! older than the window are evicted on every touch; a hard cap bounds
//! memory against pathological feeds.

use std::collections::VecDeque;

use crate::models::TokenKind;

/// Hard cap per token ring.
const MAX_SAMPLES: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts_ms: i64,
    price_cents: i64,
}

/// `delta = last - first` over the window; `velocity = |delta| / window_secs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VelocityStats {
    pub velocity_cents_per_sec: f64,
    pub delta_cents: i64,
    pub abs_move_cents: i64,
    pub ok: bool,
}

#[derive(Debug)]
pub struct VelocitySampler {
    window_secs: i64,
    rings: [VecDeque<Sample>; 2],
}

impl VelocitySampler {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            rings: [VecDeque::new(), VecDeque::new()],
        }
    }

    pub fn add(&mut self, token: TokenKind, price_cents: i64, ts_ms: i64) {
        let ring = &mut self.rings[token.index()];
        ring.push_back(Sample { ts_ms, price_cents });
        Self::evict(ring, self.window_secs, ts_ms);
    }

    pub fn stats(&mut self, token: TokenKind, now_ms: i64) -> VelocityStats {
        let window_secs = self.window_secs;
        let ring = &mut self.rings[token.index()];
        Self::evict(ring, window_secs, now_ms);

        if ring.len() < 2 {
            return VelocityStats::default();
        }

        let first = ring.front().expect("nonempty ring").price_cents;
        let last = ring.back().expect("nonempty ring").price_cents;
        let delta = last - first;
        let abs_move = delta.abs();

        VelocityStats {
            velocity_cents_per_sec: abs_move as f64 / window_secs as f64,
            delta_cents: delta,
            abs_move_cents: abs_move,
            ok: true,
        }
    }

    /// Drop all samples (cycle rotation).
    pub fn clear(&mut self) {
        self.rings[0].clear();
        self.rings[1].clear();
    }

    pub fn len(&self, token: TokenKind) -> usize {
        self.rings[token.index()].len()
    }

    fn evict(ring: &mut VecDeque<Sample>, window_secs: i64, now_ms: i64) {
        let horizon = now_ms - window_secs * 1000;
        while let Some(front) = ring.front() {
            if front.ts_ms < horizon {
                ring.pop_front();
            } else {
                break;
            }
        }
        while ring.len() > MAX_SAMPLES {
            ring.pop_front();
        }
    }
}
