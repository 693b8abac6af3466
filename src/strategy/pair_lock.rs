//! Paired-lock arbitrage.
//!
//! Signal: `yes_ask + no_ask <= 100 - profit_target`. Buying one FAK unit
//! of each side locks a complete set below redemption value; whatever the
//! outcome, the pair resolves to 100 cents per share. The loop is
//! single-threaded: price signals, command results, order updates and a
//! one-second tick all land on the same task, and every IO round-trip goes
//! through the command executor.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::exec::command::{Command, CommandExecutor};
use crate::exec::trading::{TopOfBook, TradingService};
use crate::models::{
    now_ms, now_secs, Market, Order, OrderType, PriceChangedEvent, Side, TokenKind,
};
use crate::session::session::Session;
use crate::strategy::{CycleState, PriceSlots, Strategy};

const FILL_TOLERANCE: f64 = 1e-8;
/// Repeated fill events for one order within this window are ignored.
const DUP_EVENT_WINDOW_MS: i64 = 1_000;
const QUOTE_TIMEOUT: Duration = Duration::from_secs(5);
const ORDER_TIMEOUT: Duration = Duration::from_secs(25);

// ============================================================================
// Configuration
// ============================================================================

/// What to do with a plan that cannot complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailPolicy {
    /// Mark the strategy paused; leave fills alone.
    Pause,
    /// Best-effort cancel of the plan's live orders, then pause.
    CancelPause,
    /// Cancel, sell the overfilled leg back FAK at best bid, then pause.
    FlattenPause,
}

#[derive(Debug, Clone)]
pub struct PairLockConfig {
    pub profit_target_cents: i64,
    /// Target shares per leg.
    pub order_size: f64,
    pub max_trades_per_cycle: u32,
    pub cooldown_ms: i64,
    /// Allow several concurrent plans (with the in-flight share budget).
    pub parallel: bool,
    pub max_concurrent_plans: usize,
    /// Parallel mode: bound on total target shares in flight (worst-case
    /// single-leg naked exposure).
    pub max_inflight_shares: f64,
    pub max_plan_age_secs: i64,
    pub max_supplement_attempts: u32,
    /// No new plans this close to the cycle end.
    pub cycle_cutoff_secs: i64,
    /// Per-round notional budget.
    pub budget_usd: f64,
    /// Extra cents of limit above the quoted ask (0 = take exactly at ask).
    pub slippage_cap_cents: i64,
    pub min_notional_usd: f64,
    pub min_flatten_shares: f64,
    pub on_fail: OnFailPolicy,
}

impl Default for PairLockConfig {
    fn default() -> Self {
        Self {
            profit_target_cents: 5,
            order_size: 2.0,
            max_trades_per_cycle: 3,
            cooldown_ms: 10_000,
            parallel: false,
            max_concurrent_plans: 2,
            max_inflight_shares: 20.0,
            max_plan_age_secs: 30,
            max_supplement_attempts: 3,
            cycle_cutoff_secs: 120,
            budget_usd: 50.0,
            slippage_cap_cents: 0,
            min_notional_usd: 1.0,
            min_flatten_shares: 0.5,
            on_fail: OnFailPolicy::Pause,
        }
    }
}

// ============================================================================
// Plan state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Submitting,
    Waiting,
    Supplementing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegKind {
    Entry,
    Supplement,
    Flatten,
}

#[derive(Debug)]
struct Plan {
    id: String,
    market_slug: String,
    target_size: f64,
    yes_template: Order,
    no_template: Order,
    yes_filled: f64,
    no_filled: f64,
    state: PlanState,
    supplement_attempts: u32,
    supplement_inflight: bool,
    /// order_id -> leg token.
    legs: HashMap<String, TokenKind>,
    legs_placed: u32,
    created_at_ms: i64,
}

impl Plan {
    fn filled(&self, token: TokenKind) -> f64 {
        match token {
            TokenKind::Up => self.yes_filled,
            TokenKind::Down => self.no_filled,
        }
    }

    fn add_fill(&mut self, token: TokenKind, delta: f64) {
        match token {
            TokenKind::Up => self.yes_filled += delta,
            TokenKind::Down => self.no_filled += delta,
        }
    }

    fn template(&self, token: TokenKind) -> &Order {
        match token {
            TokenKind::Up => &self.yes_template,
            TokenKind::Down => &self.no_template,
        }
    }

    fn is_complete(&self) -> bool {
        self.yes_filled.min(self.no_filled) + FILL_TOLERANCE >= self.target_size
    }

    fn imbalance(&self) -> f64 {
        (self.yes_filled - self.no_filled).abs()
    }

    /// The side that still needs shares.
    fn underfilled(&self) -> TokenKind {
        if self.yes_filled < self.no_filled {
            TokenKind::Up
        } else {
            TokenKind::Down
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, PlanState::Completed | PlanState::Failed)
    }
}

// ============================================================================
// Loop messages
// ============================================================================

enum CtrlMsg {
    Cycle {
        new: Arc<Market>,
    },
}

enum CmdResult {
    EntryQuote {
        result: Result<TopOfBook>,
    },
    SupplementQuote {
        plan_id: String,
        result: Result<TopOfBook>,
    },
    FlattenQuote {
        plan_id: String,
        token: TokenKind,
        size: f64,
        result: Result<TopOfBook>,
    },
    Placed {
        plan_id: String,
        token: TokenKind,
        kind: LegKind,
        result: Result<Order>,
    },
    CancelDone {
        order_id: String,
        ok: bool,
    },
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct PairLockMetrics {
    pub signals: AtomicU64,
    pub quotes: AtomicU64,
    pub plans_created: AtomicU64,
    pub plans_completed: AtomicU64,
    pub plans_failed: AtomicU64,
    pub supplements_placed: AtomicU64,
    pub supplement_skips: AtomicU64,
    pub gate_skips: AtomicU64,
    pub queue_drops: AtomicU64,
    pub trades_this_cycle: AtomicU64,
    pub active_plans: AtomicU64,
}

impl PairLockMetrics {
    pub fn summary(&self) -> String {
        format!(
            "signals={} quotes={} plans={}/{}ok/{}fail supplements={} skips={} queue_drops={}",
            self.signals.load(Ordering::Relaxed),
            self.quotes.load(Ordering::Relaxed),
            self.plans_created.load(Ordering::Relaxed),
            self.plans_completed.load(Ordering::Relaxed),
            self.plans_failed.load(Ordering::Relaxed),
            self.supplements_placed.load(Ordering::Relaxed),
            self.gate_skips.load(Ordering::Relaxed),
            self.queue_drops.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// Strategy
// ============================================================================

struct LoopState {
    market: Option<Arc<Market>>,
    cycle: CycleState,
    paused: bool,
    quote_inflight: bool,
    plans: HashMap<String, Plan>,
    /// order_id -> plan_id.
    order_index: HashMap<String, String>,
    /// order_id -> counted filled_size (monotone).
    last_counted: HashMap<String, f64>,
    /// order_id -> (last event ms, last seen filled_size) for dedup.
    recent_events: HashMap<String, (i64, f64)>,
    total_cost_cents: f64,
}

impl LoopState {
    fn new() -> Self {
        Self {
            market: None,
            cycle: CycleState::new(),
            paused: false,
            quote_inflight: false,
            plans: HashMap::new(),
            order_index: HashMap::new(),
            last_counted: HashMap::new(),
            recent_events: HashMap::new(),
            total_cost_cents: 0.0,
        }
    }

    fn active_plans(&self) -> usize {
        self.plans.values().filter(|p| !p.is_terminal()).count()
    }

    fn inflight_target_shares(&self) -> f64 {
        self.plans
            .values()
            .filter(|p| !p.is_terminal())
            .map(|p| p.target_size)
            .sum()
    }
}

pub struct PairLockStrategy {
    cfg: PairLockConfig,
    trading: Arc<dyn TradingService>,
    executor: Arc<CommandExecutor>,
    slots: Arc<PriceSlots>,
    order_tx: mpsc::Sender<Order>,
    order_rx: Mutex<Option<mpsc::Receiver<Order>>>,
    ctrl_tx: mpsc::Sender<CtrlMsg>,
    ctrl_rx: Mutex<Option<mpsc::Receiver<CtrlMsg>>>,
    result_tx: mpsc::Sender<CmdResult>,
    result_rx: Mutex<Option<mpsc::Receiver<CmdResult>>>,
    shutdown_tx: watch::Sender<bool>,
    paused_flag: AtomicBool,
    metrics: PairLockMetrics,
}

impl PairLockStrategy {
    pub fn new(
        cfg: PairLockConfig,
        trading: Arc<dyn TradingService>,
        executor: Arc<CommandExecutor>,
    ) -> Arc<Self> {
        let (order_tx, order_rx) = mpsc::channel(1024);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let (result_tx, result_rx) = mpsc::channel(4096);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            trading,
            executor,
            slots: PriceSlots::new(),
            order_tx,
            order_rx: Mutex::new(Some(order_rx)),
            ctrl_tx,
            ctrl_rx: Mutex::new(Some(ctrl_rx)),
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
            shutdown_tx,
            paused_flag: AtomicBool::new(false),
            metrics: PairLockMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &PairLockMetrics {
        &self.metrics
    }

    pub fn is_paused(&self) -> bool {
        self.paused_flag.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn spawn(self: &Arc<Self>) {
        let strategy = self.clone();
        tokio::spawn(async move {
            strategy.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut order_rx = self.order_rx.lock().take().expect("loop started twice");
        let mut ctrl_rx = self.ctrl_rx.lock().take().expect("loop started twice");
        let mut result_rx = self.result_rx.lock().take().expect("loop started twice");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut st = LoopState::new();
        info!("pair_lock_loop_started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = self.slots.notify.notified() => {
                    let batch = self.slots.take();
                    for token in TokenKind::BOTH {
                        if let Some(ev) = batch[token.index()].as_ref() {
                            self.on_price(ev, &mut st);
                        }
                    }
                }
                Some(order) = order_rx.recv() => self.on_order_update(&order, &mut st),
                Some(msg) = ctrl_rx.recv() => self.on_ctrl(msg, &mut st),
                Some(result) = result_rx.recv() => self.on_cmd_result(result, &mut st),
                _ = tick.tick() => self.on_tick(&mut st),
            }
            self.metrics
                .active_plans
                .store(st.active_plans() as u64, Ordering::Relaxed);
        }
        info!(metrics = %self.metrics.summary(), "pair_lock_loop_exit");
    }

    // ------------------------------------------------------------------
    // Event handlers (single-threaded)
    // ------------------------------------------------------------------

    fn on_ctrl(&self, msg: CtrlMsg, st: &mut LoopState) {
        match msg {
            CtrlMsg::Cycle { new } => {
                let start_ms = if new.timestamp > 0 {
                    new.timestamp * 1000
                } else {
                    now_ms()
                };
                st.cycle.reset(start_ms);
                st.market = Some(new.clone());
                st.paused = false;
                st.quote_inflight = false;
                st.plans.clear();
                st.order_index.clear();
                st.last_counted.clear();
                st.recent_events.clear();
                self.paused_flag.store(false, Ordering::SeqCst);
                self.metrics.trades_this_cycle.store(0, Ordering::Relaxed);
                info!(slug = %new.slug, "pair_lock_cycle_reset");
            }
        }
    }

    fn on_price(&self, _event: &PriceChangedEvent, st: &mut LoopState) {
        self.metrics.signals.fetch_add(1, Ordering::Relaxed);
        let Some(market) = st.market.clone() else {
            return;
        };
        if st.paused {
            return;
        }
        let now = now_ms();
        if market.seconds_remaining(now_secs()) <= self.cfg.cycle_cutoff_secs {
            self.skip("cycle_cutoff");
            return;
        }
        if st.cycle.trades_this_cycle >= self.cfg.max_trades_per_cycle {
            self.skip("trade_cap");
            return;
        }
        let max_plans = if self.cfg.parallel {
            self.cfg.max_concurrent_plans
        } else {
            1
        };
        if st.active_plans() >= max_plans {
            self.skip("plan_inflight");
            return;
        }
        if !st.cycle.cooldown_elapsed(now, self.cfg.cooldown_ms) {
            self.skip("cooldown");
            return;
        }
        if st.quote_inflight {
            return;
        }

        st.quote_inflight = true;
        self.metrics.quotes.fetch_add(1, Ordering::Relaxed);
        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let cmd = Command::new("pair_lock_quote", QUOTE_TIMEOUT, async move {
            let result = trading.get_top_of_book(&market).await;
            let _ = tx.try_send(CmdResult::EntryQuote { result });
        });
        if !self.executor.submit(cmd) {
            st.quote_inflight = false;
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_cmd_result(&self, result: CmdResult, st: &mut LoopState) {
        match result {
            CmdResult::EntryQuote { result } => self.on_entry_quote(result, st),
            CmdResult::SupplementQuote { plan_id, result } => {
                self.on_supplement_quote(&plan_id, result, st)
            }
            CmdResult::FlattenQuote {
                plan_id,
                token,
                size,
                result,
            } => self.on_flatten_quote(&plan_id, token, size, result, st),
            CmdResult::Placed {
                plan_id,
                token,
                kind,
                result,
            } => self.on_placed(&plan_id, token, kind, result, st),
            CmdResult::CancelDone { order_id, ok } => {
                if !ok {
                    // The exchange may auto-expire it; nothing else to do.
                    warn!(order_id = %order_id, "pair_lock_cancel_failed");
                }
            }
        }
    }

    fn on_entry_quote(&self, result: Result<TopOfBook>, st: &mut LoopState) {
        st.quote_inflight = false;
        let Some(market) = st.market.clone() else {
            return;
        };
        let tob = match result {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "pair_lock_quote_failed");
                return;
            }
        };
        if st.paused || st.cycle.trades_this_cycle >= self.cfg.max_trades_per_cycle {
            return;
        }
        let max_plans = if self.cfg.parallel {
            self.cfg.max_concurrent_plans
        } else {
            1
        };
        if st.active_plans() >= max_plans {
            return;
        }
        let (yes_ask, no_ask) = (tob.yes_ask, tob.no_ask);
        if yes_ask <= 0 || no_ask <= 0 {
            self.skip("quote_incomplete");
            return;
        }
        let total = yes_ask + no_ask;
        if total > 100 - self.cfg.profit_target_cents {
            self.skip("signal_gone");
            return;
        }

        // Unified size: both legs clear the exchange minimum notional.
        let mut size = self.cfg.order_size;
        for ask in [yes_ask, no_ask] {
            let min_size = self.cfg.min_notional_usd * 100.0 / ask as f64;
            if size < min_size {
                size = (min_size * 100.0).ceil() / 100.0;
            }
        }
        if size * total as f64 / 100.0 > self.cfg.budget_usd {
            self.skip("budget");
            return;
        }
        if self.cfg.parallel
            && st.inflight_target_shares() + size > self.cfg.max_inflight_shares
        {
            self.skip("inflight_share_budget");
            return;
        }

        let plan_id = Uuid::new_v4().to_string();
        let yes_limit = (yes_ask + self.cfg.slippage_cap_cents).min(99);
        let no_limit = (no_ask + self.cfg.slippage_cap_cents).min(99);
        let yes_order = Order::request(
            market.slug.clone(),
            market.yes_asset_id.clone(),
            Some(TokenKind::Up),
            Side::Buy,
            yes_limit,
            size,
            OrderType::Fak,
        )
        .entry();
        let no_order = Order::request(
            market.slug.clone(),
            market.no_asset_id.clone(),
            Some(TokenKind::Down),
            Side::Buy,
            no_limit,
            size,
            OrderType::Fak,
        )
        .entry();

        let plan = Plan {
            id: plan_id.clone(),
            market_slug: market.slug.clone(),
            target_size: size,
            yes_template: yes_order.clone(),
            no_template: no_order.clone(),
            yes_filled: 0.0,
            no_filled: 0.0,
            state: PlanState::Submitting,
            supplement_attempts: 0,
            supplement_inflight: false,
            legs: HashMap::new(),
            legs_placed: 0,
            created_at_ms: now_ms(),
        };
        st.plans.insert(plan_id.clone(), plan);
        st.cycle.record_trigger(now_ms());
        self.metrics.plans_created.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .trades_this_cycle
            .store(st.cycle.trades_this_cycle as u64, Ordering::Relaxed);
        info!(
            plan_id = %plan_id,
            yes_ask,
            no_ask,
            size,
            locked_cents = 100 - total,
            "pair_lock_plan_submitting"
        );

        let mut submitted = true;
        for (token, order) in [(TokenKind::Up, yes_order), (TokenKind::Down, no_order)] {
            submitted &= self.submit_place(&plan_id, token, LegKind::Entry, order);
        }
        if !submitted {
            self.fail_plan(&plan_id, "command queue overflow", st);
        }
    }

    fn submit_place(&self, plan_id: &str, token: TokenKind, kind: LegKind, order: Order) -> bool {
        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let plan_id = plan_id.to_string();
        let cmd = Command::new("pair_lock_place", ORDER_TIMEOUT, async move {
            let result = trading.place_order(order).await;
            let _ = tx.try_send(CmdResult::Placed {
                plan_id,
                token,
                kind,
                result,
            });
        });
        let ok = self.executor.submit(cmd);
        if !ok {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    fn on_placed(
        &self,
        plan_id: &str,
        token: TokenKind,
        kind: LegKind,
        result: Result<Order>,
        st: &mut LoopState,
    ) {
        if kind == LegKind::Flatten {
            match result {
                Ok(order) => info!(order_id = %order.order_id, filled = order.filled_size, "pair_lock_flatten_done"),
                Err(e) => warn!(error = %e, "pair_lock_flatten_failed"),
            }
            return;
        }
        let order = match result {
            Ok(order) => order,
            Err(e) => {
                warn!(plan_id, %token, error = %e, "pair_lock_place_failed");
                self.fail_plan(plan_id, "order place failed", st);
                return;
            }
        };

        if let Some(plan) = st.plans.get_mut(plan_id) {
            plan.legs.insert(order.order_id.clone(), token);
            st.order_index
                .insert(order.order_id.clone(), plan_id.to_string());
            if kind == LegKind::Entry {
                plan.legs_placed += 1;
                if plan.legs_placed >= 2 && plan.state == PlanState::Submitting {
                    plan.state = PlanState::Waiting;
                }
            } else {
                self.metrics.supplements_placed.fetch_add(1, Ordering::Relaxed);
            }
        }
        // The ack carries fill information for FAK; apply idempotently.
        self.apply_fill(&order, st);
    }

    fn on_order_update(&self, order: &Order, st: &mut LoopState) {
        if !st.order_index.contains_key(&order.order_id) {
            return;
        }
        // Deduplicate: the same fill level may arrive via ack and stream.
        let now = now_ms();
        if let Some((ts, filled)) = st.recent_events.get(&order.order_id) {
            if now - ts < DUP_EVENT_WINDOW_MS && (order.filled_size - filled).abs() < FILL_TOLERANCE
            {
                return;
            }
        }
        st.recent_events
            .insert(order.order_id.clone(), (now, order.filled_size));
        self.apply_fill(order, st);
    }

    /// Monotone fill application: only the positive delta over what was
    /// already counted lands on the plan.
    fn apply_fill(&self, order: &Order, st: &mut LoopState) {
        let Some(plan_id) = st.order_index.get(&order.order_id).cloned() else {
            return;
        };
        let counted = st.last_counted.get(&order.order_id).copied().unwrap_or(0.0);
        let delta = order.filled_size - counted;
        if delta <= FILL_TOLERANCE {
            return;
        }
        st.last_counted
            .insert(order.order_id.clone(), order.filled_size);

        let completed = {
            let Some(plan) = st.plans.get_mut(&plan_id) else {
                return;
            };
            let Some(token) = plan.legs.get(&order.order_id).copied() else {
                return;
            };
            plan.add_fill(token, delta);
            let price = order.filled_price_cents.unwrap_or(order.price_cents) as f64;
            st.total_cost_cents += price * delta;
            debug!(
                plan_id = %plan.id,
                %token,
                delta,
                yes = plan.yes_filled,
                no = plan.no_filled,
                "pair_lock_fill"
            );
            if !plan.is_terminal() && plan.is_complete() {
                plan.state = PlanState::Completed;
                true
            } else {
                false
            }
        };

        if completed {
            self.metrics.plans_completed.fetch_add(1, Ordering::Relaxed);
            let plan = st.plans.remove(&plan_id).expect("plan present");
            for order_id in plan.legs.keys() {
                st.order_index.remove(order_id);
            }
            info!(
                plan_id = %plan.id,
                target = plan.target_size,
                yes = plan.yes_filled,
                no = plan.no_filled,
                "pair_lock_plan_completed"
            );
        }
    }

    fn on_tick(&self, st: &mut LoopState) {
        let now = now_ms();
        st.recent_events
            .retain(|_, seen| now - seen.0 < 10 * DUP_EVENT_WINDOW_MS);

        let plan_ids: Vec<String> = st.plans.keys().cloned().collect();
        for plan_id in plan_ids {
            let (age_ms, state, imbalance, attempts, inflight) = {
                let Some(plan) = st.plans.get(&plan_id) else {
                    continue;
                };
                (
                    now - plan.created_at_ms,
                    plan.state,
                    plan.imbalance(),
                    plan.supplement_attempts,
                    plan.supplement_inflight,
                )
            };
            if matches!(state, PlanState::Completed | PlanState::Failed) {
                continue;
            }
            if age_ms > self.cfg.max_plan_age_secs * 1000 {
                self.fail_plan(&plan_id, "plan aged out", st);
                continue;
            }
            if imbalance > FILL_TOLERANCE && !inflight {
                if attempts >= self.cfg.max_supplement_attempts {
                    self.fail_plan(&plan_id, "supplement attempts exhausted", st);
                    continue;
                }
                self.start_supplement(&plan_id, st);
            }
        }
    }

    fn start_supplement(&self, plan_id: &str, st: &mut LoopState) {
        let Some(market) = st.market.clone() else {
            return;
        };
        let Some(plan) = st.plans.get_mut(plan_id) else {
            return;
        };
        plan.supplement_attempts += 1;
        plan.supplement_inflight = true;
        plan.state = PlanState::Supplementing;
        debug!(
            plan_id = %plan.id,
            attempt = plan.supplement_attempts,
            "pair_lock_supplement_quote"
        );

        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let captured_id = plan_id.to_string();
        let cmd = Command::new("pair_lock_supplement_quote", QUOTE_TIMEOUT, async move {
            let result = trading.get_top_of_book(&market).await;
            let _ = tx.try_send(CmdResult::SupplementQuote {
                plan_id: captured_id,
                result,
            });
        });
        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            if let Some(plan) = st.plans.get_mut(plan_id) {
                plan.supplement_inflight = false;
            }
        }
    }

    fn on_supplement_quote(&self, plan_id: &str, result: Result<TopOfBook>, st: &mut LoopState) {
        let (under, imbalance, other_price, market_slug, asset_id) = {
            let Some(plan) = st.plans.get_mut(plan_id) else {
                return;
            };
            plan.supplement_inflight = false;
            if plan.is_terminal() || plan.imbalance() <= FILL_TOLERANCE {
                return;
            }
            let under = plan.underfilled();
            let other = plan.template(under.complement()).price_cents;
            let Some(market) = st.market.as_ref() else {
                return;
            };
            (
                under,
                plan.imbalance(),
                other,
                plan.market_slug.clone(),
                market.asset_id(under).to_string(),
            )
        };

        let tob = match result {
            Ok(t) => t,
            Err(e) => {
                debug!(plan_id, error = %e, "pair_lock_supplement_quote_failed");
                return;
            }
        };

        // Keep the locked-profit bound: the supplement may pay at most what
        // the original signal left for this side.
        let max_price = 100 - self.cfg.profit_target_cents - other_price;
        if max_price <= 0 {
            self.metrics.supplement_skips.fetch_add(1, Ordering::Relaxed);
            debug!(plan_id, max_price, "pair_lock_supplement_unpriceable");
            return;
        }
        let ask = tob.ask(under);
        if ask <= 0 || ask > max_price {
            self.metrics.supplement_skips.fetch_add(1, Ordering::Relaxed);
            debug!(plan_id, ask, max_price, "pair_lock_supplement_too_expensive");
            return;
        }

        let limit = (ask + self.cfg.slippage_cap_cents).min(max_price);
        let size = (imbalance * 100.0).round() / 100.0;
        if size * limit as f64 / 100.0 < self.cfg.min_notional_usd {
            self.metrics.supplement_skips.fetch_add(1, Ordering::Relaxed);
            debug!(plan_id, size, "pair_lock_supplement_below_min_notional");
            return;
        }

        let order = Order::request(
            market_slug,
            asset_id,
            Some(under),
            Side::Buy,
            limit,
            size,
            OrderType::Fak,
        );
        self.submit_place(plan_id, under, LegKind::Supplement, order);
    }

    fn fail_plan(&self, plan_id: &str, reason: &str, st: &mut LoopState) {
        let (live_orders, over_token, imbalance) = {
            let Some(plan) = st.plans.get_mut(plan_id) else {
                return;
            };
            if plan.is_terminal() {
                return;
            }
            plan.state = PlanState::Failed;
            let live: Vec<String> = plan.legs.keys().cloned().collect();
            (live, plan.underfilled().complement(), plan.imbalance())
        };
        self.metrics.plans_failed.fetch_add(1, Ordering::Relaxed);
        warn!(plan_id, reason, policy = ?self.cfg.on_fail, "pair_lock_plan_failed");

        match self.cfg.on_fail {
            OnFailPolicy::Pause => {}
            OnFailPolicy::CancelPause => {
                self.submit_cancels(&live_orders);
            }
            OnFailPolicy::FlattenPause => {
                self.submit_cancels(&live_orders);
                if imbalance >= self.cfg.min_flatten_shares {
                    self.start_flatten(plan_id, over_token, imbalance, st);
                } else {
                    debug!(plan_id, imbalance, "pair_lock_flatten_below_threshold");
                }
            }
        }
        st.paused = true;
        self.paused_flag.store(true, Ordering::SeqCst);
    }

    fn submit_cancels(&self, order_ids: &[String]) {
        for order_id in order_ids {
            let trading = self.trading.clone();
            let tx = self.result_tx.clone();
            let order_id = order_id.clone();
            let cmd = Command::new("pair_lock_cancel", ORDER_TIMEOUT, async move {
                let ok = trading.cancel_order(&order_id).await.is_ok();
                let _ = tx.try_send(CmdResult::CancelDone { order_id, ok });
            });
            if !self.executor.submit(cmd) {
                self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn start_flatten(&self, plan_id: &str, token: TokenKind, size: f64, st: &mut LoopState) {
        let Some(market) = st.market.clone() else {
            return;
        };
        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let plan_id = plan_id.to_string();
        let cmd = Command::new("pair_lock_flatten_quote", QUOTE_TIMEOUT, async move {
            let result = trading.get_top_of_book(&market).await;
            let _ = tx.try_send(CmdResult::FlattenQuote {
                plan_id,
                token,
                size,
                result,
            });
        });
        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_flatten_quote(
        &self,
        plan_id: &str,
        token: TokenKind,
        size: f64,
        result: Result<TopOfBook>,
        st: &mut LoopState,
    ) {
        let Some(market) = st.market.clone() else {
            return;
        };
        let tob = match result {
            Ok(t) => t,
            Err(e) => {
                warn!(plan_id, error = %e, "pair_lock_flatten_quote_failed");
                return;
            }
        };
        let bid = tob.bid(token);
        if bid <= 0 {
            warn!(plan_id, %token, "pair_lock_flatten_no_bid");
            return;
        }
        let order = Order::request(
            market.slug.clone(),
            market.asset_id(token).to_string(),
            Some(token),
            Side::Sell,
            bid,
            size,
            OrderType::Fak,
        );
        info!(plan_id, %token, size, bid, "pair_lock_flatten_sell");
        self.submit_place(plan_id, token, LegKind::Flatten, order);
    }

    fn skip(&self, reason: &'static str) {
        self.metrics.gate_skips.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "pair_lock_skip");
    }
}

impl Strategy for PairLockStrategy {
    fn name(&self) -> &'static str {
        "pair_lock"
    }

    fn attach(&self, session: &Arc<Session>) {
        let slots = self.slots.clone();
        session.on_price_changed(Arc::new(move |ev: &PriceChangedEvent| slots.offer(ev)));
        let tx = self.order_tx.clone();
        session.on_order_update(Arc::new(move |order: &Order| {
            let _ = tx.try_send(order.clone());
        }));
    }

    fn on_cycle(&self, _old: Option<Arc<Market>>, new: Arc<Market>) {
        let _ = self.ctrl_tx.try_send(CtrlMsg::Cycle { new });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::command::ExecutionMode;
    use crate::exec::trading::PaperTradingService;
    use crate::market::best_book::AtomicBestBook;
    use crate::models::scale_size;

    struct Rig {
        strategy: Arc<PairLockStrategy>,
        trading: Arc<PaperTradingService>,
        book: Arc<AtomicBestBook>,
        market: Arc<Market>,
        result_rx: mpsc::Receiver<CmdResult>,
        st: LoopState,
    }

    fn rig(cfg: PairLockConfig) -> Rig {
        let book = Arc::new(AtomicBestBook::new());
        book.update_token(TokenKind::Up, 46, 48, scale_size(50.0), scale_size(50.0));
        book.update_token(TokenKind::Down, 47, 49, scale_size(50.0), scale_size(50.0));
        let trading = PaperTradingService::new(book.clone());
        let market = Arc::new(Market::new(
            // A slug far in the future keeps the cycle-cutoff gate open.
            format!("btc-updown-15m-{}", now_secs() + 600),
            "0xcond",
            "yes-asset",
            "no-asset",
        ));
        trading.set_current_market_info(market.clone());
        let executor = CommandExecutor::spawn(ExecutionMode::Serial, 256);
        let strategy = PairLockStrategy::new(cfg, trading.clone(), executor);
        let result_rx = strategy.result_rx.lock().take().unwrap();
        let mut st = LoopState::new();
        strategy.on_ctrl(
            CtrlMsg::Cycle {
                new: market.clone(),
            },
            &mut st,
        );
        Rig {
            strategy,
            trading,
            book,
            market,
            result_rx,
            st,
        }
    }

    fn price_event(market: &Arc<Market>) -> PriceChangedEvent {
        PriceChangedEvent {
            market: market.clone(),
            token: TokenKind::Up,
            price_cents: 47,
            timestamp_ms: now_ms(),
        }
    }

    /// Drain executor results into the loop until quiet.
    async fn pump(rig: &mut Rig) {
        loop {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let mut progressed = false;
            while let Ok(result) = rig.result_rx.try_recv() {
                rig.strategy.on_cmd_result(result, &mut rig.st);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes_plan() {
        // S1: 48c + 49c = 97 <= 100 - profit_target(3)? Use asks 48/49 and
        // target 3 so the signal holds.
        let mut r = rig(PairLockConfig {
            profit_target_cents: 3,
            order_size: 2.0,
            ..PairLockConfig::default()
        });

        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        assert!(r.st.quote_inflight);
        pump(&mut r).await;

        // Both FAK legs filled against the paper book; the plan completed
        // and was retired.
        assert!(r.st.plans.is_empty());
        assert_eq!(
            r.strategy.metrics().plans_created.load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            r.strategy.metrics().plans_completed.load(Ordering::Relaxed),
            1
        );
        assert_eq!(r.st.cycle.trades_this_cycle, 1);

        // Both positions on the books.
        let positions = r
            .trading
            .get_open_positions_for_market(&r.market.slug)
            .await
            .unwrap();
        assert_eq!(positions.len(), 2);
        for p in positions {
            assert!((p.size - 2.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_signal_gone_skips() {
        // Asks sum to 97 > 100 - 5: no plan.
        let mut r = rig(PairLockConfig {
            profit_target_cents: 5,
            ..PairLockConfig::default()
        });
        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        pump(&mut r).await;
        assert!(r.st.plans.is_empty());
        assert_eq!(
            r.strategy.metrics().plans_created.load(Ordering::Relaxed),
            0
        );
    }

    /// Build a one-legged (YES-only) live plan: the quote sees a valid pair
    /// but the NO book is pulled before the FAK lands.
    async fn rig_with_naked_yes_plan(cfg: PairLockConfig) -> Rig {
        let mut r = rig(cfg);
        r.book.reset();
        r.book
            .update_token(TokenKind::Up, 46, 48, scale_size(50.0), scale_size(50.0));
        r.book
            .update_token(TokenKind::Down, 45, 47, scale_size(50.0), scale_size(50.0));
        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let quote = r.result_rx.recv().await.unwrap();
        r.book.update_token(TokenKind::Down, 45, 60, 0, 0);
        r.strategy.on_cmd_result(quote, &mut r.st);
        pump(&mut r).await;
        assert_eq!(r.st.active_plans(), 1);
        r
    }

    #[tokio::test]
    async fn test_single_inflight_plan_when_not_parallel() {
        let mut r = rig_with_naked_yes_plan(PairLockConfig {
            profit_target_cents: 5,
            cooldown_ms: 0,
            parallel: false,
            ..PairLockConfig::default()
        })
        .await;

        // With one plan still live, a new signal must not quote again.
        let skips_before = r.strategy.metrics().gate_skips.load(Ordering::Relaxed);
        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        assert!(!r.st.quote_inflight);
        assert_eq!(
            r.strategy.metrics().gate_skips.load(Ordering::Relaxed),
            skips_before + 1
        );
    }

    #[tokio::test]
    async fn test_supplement_price_cap_and_exhaustion() {
        // S2: YES fills at 48, NO misses. Supplement cap = 100-5-48 = 47;
        // the NO ask sits at 50 so every attempt is skipped, and exhaustion
        // fails the plan and pauses the strategy.
        let mut r = rig(PairLockConfig {
            profit_target_cents: 5,
            order_size: 2.0,
            max_supplement_attempts: 2,
            on_fail: OnFailPolicy::Pause,
            ..PairLockConfig::default()
        });
        // Make the pair signal valid at quote time (47 ask on NO), then
        // pull the NO book before the FAK lands so only YES fills.
        r.book.reset();
        r.book
            .update_token(TokenKind::Up, 46, 48, scale_size(50.0), scale_size(50.0));
        r.book
            .update_token(TokenKind::Down, 45, 47, scale_size(50.0), scale_size(50.0));

        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        // Quote comes back with 48/47 (total 95 <= 95). Before pumping the
        // placement results, gut the NO side so its FAK misses.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let quote = r.result_rx.recv().await.unwrap();
        r.book.update_token(TokenKind::Down, 45, 60, 0, 0);
        r.strategy.on_cmd_result(quote, &mut r.st);
        pump(&mut r).await;

        let plan = r.st.plans.values().next().expect("plan alive");
        assert!((plan.yes_filled - 2.0).abs() < 1e-9);
        assert_eq!(plan.no_filled, 0.0);
        let plan_id = plan.id.clone();

        // Restore a NO ask of 50: above the 47 cap, so supplements skip.
        r.book
            .update_token(TokenKind::Down, 45, 50, scale_size(50.0), scale_size(50.0));

        r.strategy.on_tick(&mut r.st); // attempt 1 (quote)
        pump(&mut r).await;
        assert_eq!(
            r.strategy.metrics().supplement_skips.load(Ordering::Relaxed),
            1
        );
        assert_eq!(r.st.plans[&plan_id].supplement_attempts, 1);
        assert_eq!(r.st.plans[&plan_id].no_filled, 0.0);

        r.strategy.on_tick(&mut r.st); // attempt 2
        pump(&mut r).await;
        assert_eq!(r.st.plans[&plan_id].supplement_attempts, 2);

        r.strategy.on_tick(&mut r.st); // exhausted -> fail + pause
        assert_eq!(r.st.plans[&plan_id].state, PlanState::Failed);
        assert!(r.st.paused);
        assert!(r.strategy.is_paused());

        // Paused strategy ignores further signals.
        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        assert!(!r.st.quote_inflight);
    }

    #[tokio::test]
    async fn test_supplement_fills_when_affordable() {
        let mut r = rig(PairLockConfig {
            profit_target_cents: 5,
            order_size: 2.0,
            ..PairLockConfig::default()
        });
        r.book.reset();
        r.book
            .update_token(TokenKind::Up, 46, 48, scale_size(50.0), scale_size(50.0));
        r.book
            .update_token(TokenKind::Down, 45, 47, scale_size(50.0), scale_size(50.0));

        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let quote = r.result_rx.recv().await.unwrap();
        r.book.update_token(TokenKind::Down, 45, 60, 0, 0);
        r.strategy.on_cmd_result(quote, &mut r.st);
        pump(&mut r).await;
        assert_eq!(r.st.active_plans(), 1);

        // NO comes back affordable (46 <= cap 47): supplement completes it.
        r.book
            .update_token(TokenKind::Down, 44, 46, scale_size(50.0), scale_size(50.0));
        r.strategy.on_tick(&mut r.st);
        pump(&mut r).await;

        assert!(r.st.plans.is_empty());
        assert_eq!(
            r.strategy.metrics().plans_completed.load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            r.strategy
                .metrics()
                .supplements_placed
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_plan_age_timeout_flatten_policy() {
        let mut r = rig(PairLockConfig {
            profit_target_cents: 5,
            order_size: 2.0,
            max_plan_age_secs: 0,
            on_fail: OnFailPolicy::FlattenPause,
            min_flatten_shares: 0.5,
            ..PairLockConfig::default()
        });
        r.book.reset();
        r.book
            .update_token(TokenKind::Up, 46, 48, scale_size(50.0), scale_size(50.0));
        r.book
            .update_token(TokenKind::Down, 45, 47, scale_size(50.0), scale_size(50.0));

        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let quote = r.result_rx.recv().await.unwrap();
        r.book.update_token(TokenKind::Down, 45, 60, 0, 0);
        r.strategy.on_cmd_result(quote, &mut r.st);
        pump(&mut r).await;

        // Next tick: the plan (age > 0s) fails; flatten sells the YES leg.
        r.strategy.on_tick(&mut r.st);
        pump(&mut r).await;

        assert!(r.st.paused);
        let positions = r
            .trading
            .get_open_positions_for_market(&r.market.slug)
            .await
            .unwrap();
        // The 2.0 YES shares were sold back FAK at best bid.
        assert!(positions.iter().all(|p| p.size < 1e-9 || p.token != Some(TokenKind::Up)));
    }

    #[tokio::test]
    async fn test_duplicate_order_events_not_double_counted() {
        let mut r = rig_with_naked_yes_plan(PairLockConfig {
            profit_target_cents: 5,
            ..PairLockConfig::default()
        })
        .await;

        let plan = r.st.plans.values().next().unwrap();
        let plan_id = plan.id.clone();
        let (yes_order_id, _) = plan
            .legs
            .iter()
            .find(|(_, t)| **t == TokenKind::Up)
            .map(|(id, t)| (id.clone(), *t))
            .unwrap();
        let yes_filled = r.st.plans[&plan_id].yes_filled;
        let cost = r.st.total_cost_cents;

        // Replay the same filled order event twice in quick succession:
        // dedup plus monotone deltas keep every tally unchanged.
        let replay = r
            .trading
            .get_order(&yes_order_id)
            .await
            .unwrap()
            .expect("order known to paper venue");
        r.strategy.on_order_update(&replay, &mut r.st);
        r.strategy.on_order_update(&replay, &mut r.st);

        assert!((r.st.plans[&plan_id].yes_filled - yes_filled).abs() < 1e-9);
        assert!((r.st.total_cost_cents - cost).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cycle_reset_clears_pause_and_state() {
        let mut r = rig(PairLockConfig {
            profit_target_cents: 5,
            max_plan_age_secs: 0,
            ..PairLockConfig::default()
        });
        r.book.reset();
        r.book
            .update_token(TokenKind::Up, 46, 48, scale_size(50.0), scale_size(50.0));
        r.book
            .update_token(TokenKind::Down, 45, 47, scale_size(50.0), scale_size(50.0));
        r.strategy.on_price(&price_event(&r.market), &mut r.st);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let quote = r.result_rx.recv().await.unwrap();
        r.book.update_token(TokenKind::Down, 45, 60, 0, 0);
        r.strategy.on_cmd_result(quote, &mut r.st);
        pump(&mut r).await;
        r.strategy.on_tick(&mut r.st);
        assert!(r.st.paused);

        let next = Arc::new(Market::new(
            format!("btc-updown-15m-{}", now_secs() + 1500),
            "0xcond2",
            "yes-2",
            "no-2",
        ));
        r.strategy.on_ctrl(CtrlMsg::Cycle { new: next }, &mut r.st);
        assert!(!r.st.paused);
        assert!(!r.strategy.is_paused());
        assert!(r.st.plans.is_empty());
        assert_eq!(r.st.cycle.trades_this_cycle, 0);
    }

    #[test]
    fn test_profit_bound_arithmetic() {
        // Invariant: for a completed plan, entry prices plus supplements
        // stay within 100 - target.
        let target = 5i64;
        let yes_entry = 48i64;
        let supplement_cap = 100 - target - yes_entry;
        assert_eq!(supplement_cap, 47);
        assert!(yes_entry + supplement_cap <= 100 - target);
    }
}
