//! Lock-free top-of-book snapshot for one paired binary market.
//!
//! Three packed 64-bit words plus a timestamp:
//! - `prices`:    [yes_bid:16][yes_ask:16][no_bid:16][no_ask:16] in cents
//! - `bid_sizes`: [yes_bid_size:32][no_bid_size:32] as shares x 10_000
//! - `ask_sizes`: [yes_ask_size:32][no_ask_size:32]
//!
//! The price word is updated in a CAS loop so the four price fields are
//! always mutually consistent; a reader never observes a torn combination.
//! Size words are updated separately and may lag prices by one update, which
//! consumers tolerate by reading prices first.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::models::{now_ms, unscale_size, TokenKind};

const FIELD_MASK: u64 = 0xFFFF;

#[inline]
fn pack_prices(yes_bid: u64, yes_ask: u64, no_bid: u64, no_ask: u64) -> u64 {
    (yes_bid << 48) | (yes_ask << 32) | (no_bid << 16) | no_ask
}

#[inline]
fn field(word: u64, shift: u32) -> i64 {
    ((word >> shift) & FIELD_MASK) as i64
}

/// Unpacked, immutable view of the book at one load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestBookSnapshot {
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub no_bid: i64,
    pub no_ask: i64,
    pub yes_bid_size: f64,
    pub yes_ask_size: f64,
    pub no_bid_size: f64,
    pub no_ask_size: f64,
    pub updated_at_ms: i64,
}

impl BestBookSnapshot {
    #[inline]
    pub fn bid(&self, token: TokenKind) -> i64 {
        match token {
            TokenKind::Up => self.yes_bid,
            TokenKind::Down => self.no_bid,
        }
    }

    #[inline]
    pub fn ask(&self, token: TokenKind) -> i64 {
        match token {
            TokenKind::Up => self.yes_ask,
            TokenKind::Down => self.no_ask,
        }
    }

    #[inline]
    pub fn bid_size(&self, token: TokenKind) -> f64 {
        match token {
            TokenKind::Up => self.yes_bid_size,
            TokenKind::Down => self.no_bid_size,
        }
    }

    #[inline]
    pub fn ask_size(&self, token: TokenKind) -> f64 {
        match token {
            TokenKind::Up => self.yes_ask_size,
            TokenKind::Down => self.no_ask_size,
        }
    }

    /// Both sides of one token present.
    #[inline]
    pub fn has_both(&self, token: TokenKind) -> bool {
        self.bid(token) > 0 && self.ask(token) > 0
    }

    /// All four top-of-book prices present.
    #[inline]
    pub fn complete(&self) -> bool {
        self.has_both(TokenKind::Up) && self.has_both(TokenKind::Down)
    }

    #[inline]
    pub fn mid_cents(&self, token: TokenKind) -> Option<i64> {
        if self.has_both(token) {
            Some((self.bid(token) + self.ask(token) + 1) / 2)
        } else {
            None
        }
    }

    #[inline]
    pub fn spread_cents(&self, token: TokenKind) -> Option<i64> {
        if self.has_both(token) {
            Some((self.ask(token) - self.bid(token)).abs())
        } else {
            None
        }
    }

    #[inline]
    pub fn is_crossed(&self, token: TokenKind) -> bool {
        self.has_both(token) && self.bid(token) >= self.ask(token)
    }

    #[inline]
    pub fn age_ms(&self, now: i64) -> i64 {
        if self.updated_at_ms <= 0 {
            i64::MAX
        } else {
            (now - self.updated_at_ms).max(0)
        }
    }
}

/// Single-writer-per-stream, many-reader top-of-book cell. Consumers hold
/// long-lived references, so cycle rotation clears this object in place
/// rather than swapping the pointer.
#[derive(Debug, Default)]
pub struct AtomicBestBook {
    prices: AtomicU64,
    bid_sizes: AtomicU64,
    ask_sizes: AtomicU64,
    updated_at_ms: AtomicI64,
}

impl AtomicBestBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one token's top-of-book. A zero in any field leaves that field
    /// unchanged. Prices go through a CAS loop on the packed word; sizes are
    /// merged per-word afterwards; the timestamp is stamped last.
    pub fn update_token(
        &self,
        token: TokenKind,
        bid_cents: i64,
        ask_cents: i64,
        bid_size_scaled: u32,
        ask_size_scaled: u32,
    ) {
        let bid = (bid_cents.clamp(0, 99)) as u64;
        let ask = (ask_cents.clamp(0, 99)) as u64;

        if bid > 0 || ask > 0 {
            let (bid_shift, ask_shift) = match token {
                TokenKind::Up => (48, 32),
                TokenKind::Down => (16, 0),
            };
            let mut cur = self.prices.load(Ordering::Acquire);
            loop {
                let mut next = cur;
                if bid > 0 {
                    next = (next & !(FIELD_MASK << bid_shift)) | (bid << bid_shift);
                }
                if ask > 0 {
                    next = (next & !(FIELD_MASK << ask_shift)) | (ask << ask_shift);
                }
                if next == cur {
                    break;
                }
                match self.prices.compare_exchange_weak(
                    cur,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        }

        if bid_size_scaled > 0 {
            merge_half(&self.bid_sizes, token, bid_size_scaled);
        }
        if ask_size_scaled > 0 {
            merge_half(&self.ask_sizes, token, ask_size_scaled);
        }

        self.updated_at_ms.store(now_ms(), Ordering::Release);
    }

    /// One atomic load per word, concatenated into a snapshot.
    pub fn load(&self) -> BestBookSnapshot {
        let prices = self.prices.load(Ordering::Acquire);
        let bid_sizes = self.bid_sizes.load(Ordering::Acquire);
        let ask_sizes = self.ask_sizes.load(Ordering::Acquire);
        let updated_at_ms = self.updated_at_ms.load(Ordering::Acquire);

        BestBookSnapshot {
            yes_bid: field(prices, 48),
            yes_ask: field(prices, 32),
            no_bid: field(prices, 16),
            no_ask: field(prices, 0),
            yes_bid_size: unscale_size((bid_sizes >> 32) as u32),
            no_bid_size: unscale_size(bid_sizes as u32),
            yes_ask_size: unscale_size((ask_sizes >> 32) as u32),
            no_ask_size: unscale_size(ask_sizes as u32),
            updated_at_ms,
        }
    }

    /// Zero every field in place. Must not be replaced by a pointer swap:
    /// sessions and strategies hold long-lived references and would keep
    /// reading the stale cell.
    pub fn reset(&self) {
        self.prices.store(0, Ordering::Release);
        self.bid_sizes.store(0, Ordering::Release);
        self.ask_sizes.store(0, Ordering::Release);
        self.updated_at_ms.store(0, Ordering::Release);
    }

    /// True iff the book has ever been written and the last write is within
    /// `max_age_ms` of now.
    pub fn is_fresh(&self, max_age_ms: i64) -> bool {
        let ts = self.updated_at_ms.load(Ordering::Acquire);
        ts > 0 && now_ms() - ts <= max_age_ms
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at_ms.load(Ordering::Acquire)
    }
}

fn merge_half(word: &AtomicU64, token: TokenKind, scaled: u32) {
    let mut cur = word.load(Ordering::Acquire);
    loop {
        let next = match token {
            TokenKind::Up => (cur & 0x0000_0000_FFFF_FFFF) | ((scaled as u64) << 32),
            TokenKind::Down => (cur & 0xFFFF_FFFF_0000_0000) | scaled as u64,
        };
        if next == cur {
            break;
        }
        match word.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}
