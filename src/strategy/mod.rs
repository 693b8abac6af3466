pub mod pair_lock;
pub mod velocity;
pub mod win_bet;

pub use pair_lock::{OnFailPolicy, PairLockConfig, PairLockStrategy, PlanState};
pub use velocity::{VelocitySampler, VelocityStats};
pub use win_bet::{WinBetConfig, WinBetStrategy};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::models::{now_ms, Market, PriceChangedEvent};
use crate::session::session::Session;

/// Event-triggered strategy bound to the active session by the scheduler.
///
/// `attach` registers the strategy's handlers on a (new) session;
/// `on_cycle` announces a cycle boundary. Strategies never work out cycle
/// identity themselves.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn attach(&self, session: &Arc<Session>);
    fn on_cycle(&self, old: Option<Arc<Market>>, new: Arc<Market>);
}

/// Latest-per-token price slots shared between a session handler and a
/// strategy loop. A burst of events collapses to one wakeup per direction.
pub struct PriceSlots {
    latest: Mutex<[Option<PriceChangedEvent>; 2]>,
    pub notify: Notify,
}

impl PriceSlots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latest: Mutex::new([None, None]),
            notify: Notify::new(),
        })
    }

    pub fn offer(&self, event: &PriceChangedEvent) {
        self.latest.lock()[event.token.index()] = Some(event.clone());
        self.notify.notify_one();
    }

    /// Swap out whatever accumulated since the last take (Up slot first).
    pub fn take(&self) -> [Option<PriceChangedEvent>; 2] {
        std::mem::replace(&mut *self.latest.lock(), [None, None])
    }
}

/// Per-cycle throttling state, reset on every cycle transition.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub cycle_start_ms: i64,
    pub last_trigger_ms: i64,
    pub trades_this_cycle: u32,
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            cycle_start_ms: now_ms(),
            last_trigger_ms: 0,
            trades_this_cycle: 0,
        }
    }

    pub fn reset(&mut self, cycle_start_ms: i64) {
        self.cycle_start_ms = cycle_start_ms;
        self.last_trigger_ms = 0;
        self.trades_this_cycle = 0;
    }

    #[inline]
    pub fn warmup_elapsed(&self, now_ms: i64, warmup_ms: i64) -> bool {
        now_ms - self.cycle_start_ms >= warmup_ms
    }

    #[inline]
    pub fn cooldown_elapsed(&self, now_ms: i64, cooldown_ms: i64) -> bool {
        self.last_trigger_ms == 0 || now_ms - self.last_trigger_ms >= cooldown_ms
    }

    pub fn record_trigger(&mut self, now_ms: i64) {
        self.last_trigger_ms = now_ms;
        self.trades_this_cycle += 1;
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}
