//! Velocity-follow entry with a complementary hedge.
//!
//! Pick the direction whose recent velocity and absolute move clear their
//! thresholds (strictly upward), buy it FAK, then quote the other side GTC
//! at `100 - entry - offset` so a filled pair costs at most `100 - offset`
//! cents per share. The hedge is nursed by a monitor: re-quoted after a
//! resting timeout, escalated to a taker FAK after the aggressive timeout,
//! and the FAK is never dispatched until the resting order's cancel has
//! been confirmed (no double hedge at the venue).

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::exec::command::{Command, CommandExecutor};
use crate::exec::trading::{TopOfBook, TradingService};
use crate::market::best_book::AtomicBestBook;
use crate::market::quality::{self, QualityConfig};
use crate::market::stability::{StabilityConfig, StabilityWindow};
use crate::models::{
    now_ms, now_secs, Market, Order, OrderStatus, OrderType, PriceChangedEvent, Side, TokenKind,
};
use crate::session::session::Session;
use crate::strategy::velocity::VelocitySampler;
use crate::strategy::{CycleState, PriceSlots, Strategy};

const QUOTE_TIMEOUT: Duration = Duration::from_secs(5);
const ORDER_TIMEOUT: Duration = Duration::from_secs(25);
const FILL_TOLERANCE: f64 = 1e-8;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct WinBetConfig {
    pub window_secs: i64,
    pub min_velocity_cents_per_sec: f64,
    pub min_move_cents: i64,
    /// On a velocity tie between both sides, take the higher-priced one.
    pub prefer_higher_price: bool,
    pub warmup_ms: i64,
    pub cooldown_ms: i64,
    pub max_trades_per_cycle: u32,
    pub end_protect_secs: i64,
    pub entry_size: f64,
    pub hedge_offset_cents: i64,
    pub entry_fill_max_wait_ms: i64,
    pub entry_fill_check_interval_ms: i64,
    pub hedge_reorder_timeout_secs: i64,
    pub aggressive_hedge_timeout_secs: i64,
    pub cancel_confirm_timeout_ms: i64,
    pub cancel_confirm_poll_ms: i64,
    pub max_acceptable_loss_cents: i64,
    pub min_quality_score: i64,
    pub quality: QualityConfig,
    pub stability: StabilityConfig,
    pub inventory_skew_threshold: f64,
    pub per_market_cooldown_ms: i64,
    pub min_notional_usd: f64,
}

impl Default for WinBetConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            min_velocity_cents_per_sec: 0.3,
            min_move_cents: 3,
            prefer_higher_price: true,
            warmup_ms: 30_000,
            cooldown_ms: 20_000,
            max_trades_per_cycle: 4,
            end_protect_secs: 120,
            entry_size: 5.0,
            hedge_offset_cents: 1,
            entry_fill_max_wait_ms: 3_000,
            entry_fill_check_interval_ms: 500,
            hedge_reorder_timeout_secs: 30,
            aggressive_hedge_timeout_secs: 60,
            cancel_confirm_timeout_ms: 5_000,
            cancel_confirm_poll_ms: 200,
            max_acceptable_loss_cents: 10,
            min_quality_score: 60,
            quality: QualityConfig::default(),
            stability: StabilityConfig::default(),
            inventory_skew_threshold: 50.0,
            per_market_cooldown_ms: 60_000,
            min_notional_usd: 1.0,
        }
    }
}

// ============================================================================
// Exposure state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationKind {
    Reorder,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HedgeState {
    /// No resting hedge at the venue (initial placement failed, or an
    /// aggressive FAK missed); the monitor re-places it.
    NeedsPlacement,
    /// GTC resting at the venue.
    Resting,
    /// Cancel requested; waiting for confirmed-cancel evidence before any
    /// replacement goes out.
    CancelPending {
        kind: EscalationKind,
        requested_at_ms: i64,
        next_poll_ms: i64,
    },
    /// Cancel confirmed; a re-quote command is in flight.
    AwaitRequote { kind: EscalationKind },
}

/// An entry fill whose paired hedge has not resolved yet.
#[derive(Debug, Clone)]
pub struct HedgeExposure {
    pub entry_order_id: String,
    pub hedge_order_id: String,
    pub entry_token: TokenKind,
    pub hedge_token: TokenKind,
    pub entry_filled_at_ms: i64,
    pub entry_filled_size: f64,
    pub entry_price_cents: i64,
    pub last_hedge_cents: i64,
    pub original_hedge_cents: i64,
    hedge_placed_at_ms: i64,
    state: HedgeState,
}

/// Entry order in flight: at most one per strategy.
#[derive(Debug, Clone)]
struct EntryPending {
    order_id: String,
    token: TokenKind,
    entry_ask: i64,
    hedge_limit: i64,
    size: f64,
    deadline_ms: i64,
    next_poll_ms: i64,
    /// Entry filled; waiting for the hedge placement ack.
    awaiting_hedge_ack: bool,
}

// ============================================================================
// Loop messages
// ============================================================================

enum CtrlMsg {
    Cycle { new: Arc<Market> },
}

enum CmdResult {
    EntryPlaced {
        result: Result<Order>,
    },
    EntryPoll {
        order_id: String,
        result: Result<Option<Order>>,
    },
    HedgePlaced {
        entry_id: String,
        result: Result<Order>,
    },
    AggressivePlaced {
        entry_id: String,
        result: Result<Order>,
    },
    HedgeQuote {
        entry_id: String,
        kind: EscalationKind,
        result: Result<TopOfBook>,
    },
    HedgePoll {
        entry_id: String,
        result: Result<Option<Order>>,
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
pub struct WinBetMetrics {
    pub signals: AtomicU64,
    pub entries_placed: AtomicU64,
    pub entries_filled: AtomicU64,
    pub entries_missed: AtomicU64,
    pub hedges_placed: AtomicU64,
    pub hedge_reorders: AtomicU64,
    pub aggressive_escalations: AtomicU64,
    pub exposures_resolved: AtomicU64,
    pub gate_skips: AtomicU64,
    pub queue_drops: AtomicU64,
    pub open_exposures: AtomicU64,
}

impl WinBetMetrics {
    pub fn summary(&self) -> String {
        format!(
            "signals={} entries={}p/{}f/{}m hedges={} reorders={} aggressive={} resolved={} skips={}",
            self.signals.load(Ordering::Relaxed),
            self.entries_placed.load(Ordering::Relaxed),
            self.entries_filled.load(Ordering::Relaxed),
            self.entries_missed.load(Ordering::Relaxed),
            self.hedges_placed.load(Ordering::Relaxed),
            self.hedge_reorders.load(Ordering::Relaxed),
            self.aggressive_escalations.load(Ordering::Relaxed),
            self.exposures_resolved.load(Ordering::Relaxed),
            self.gate_skips.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// Strategy
// ============================================================================

struct LoopState {
    market: Option<Arc<Market>>,
    cycle: CycleState,
    sampler: VelocitySampler,
    stability: StabilityWindow,
    entry: Option<EntryPending>,
    /// entry_order_id -> exposure.
    exposures: HashMap<String, HedgeExposure>,
    /// hedge_order_id -> entry_order_id.
    hedge_index: HashMap<String, String>,
    inventory: [f64; 2],
    per_market_last_ms: HashMap<String, i64>,
}

impl LoopState {
    fn new(cfg: &WinBetConfig) -> Self {
        Self {
            market: None,
            cycle: CycleState::new(),
            sampler: VelocitySampler::new(cfg.window_secs),
            stability: StabilityWindow::new(cfg.stability.clone()),
            entry: None,
            exposures: HashMap::new(),
            hedge_index: HashMap::new(),
            inventory: [0.0, 0.0],
            per_market_last_ms: HashMap::new(),
        }
    }

    fn skew(&self, token: TokenKind) -> f64 {
        self.inventory[token.index()] - self.inventory[token.complement().index()]
    }
}

pub struct WinBetStrategy {
    cfg: WinBetConfig,
    trading: Arc<dyn TradingService>,
    executor: Arc<CommandExecutor>,
    book: Arc<AtomicBestBook>,
    slots: Arc<PriceSlots>,
    order_tx: mpsc::Sender<Order>,
    order_rx: Mutex<Option<mpsc::Receiver<Order>>>,
    ctrl_tx: mpsc::Sender<CtrlMsg>,
    ctrl_rx: Mutex<Option<mpsc::Receiver<CtrlMsg>>>,
    result_tx: mpsc::Sender<CmdResult>,
    result_rx: Mutex<Option<mpsc::Receiver<CmdResult>>>,
    shutdown_tx: watch::Sender<bool>,
    exposed_flag: AtomicBool,
    metrics: WinBetMetrics,
}

impl WinBetStrategy {
    pub fn new(
        cfg: WinBetConfig,
        trading: Arc<dyn TradingService>,
        executor: Arc<CommandExecutor>,
        book: Arc<AtomicBestBook>,
    ) -> Arc<Self> {
        let (order_tx, order_rx) = mpsc::channel(1024);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let (result_tx, result_rx) = mpsc::channel(4096);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            trading,
            executor,
            book,
            slots: PriceSlots::new(),
            order_tx,
            order_rx: Mutex::new(Some(order_rx)),
            ctrl_tx,
            ctrl_rx: Mutex::new(Some(ctrl_rx)),
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
            shutdown_tx,
            exposed_flag: AtomicBool::new(false),
            metrics: WinBetMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &WinBetMetrics {
        &self.metrics
    }

    pub fn has_open_exposure(&self) -> bool {
        self.exposed_flag.load(Ordering::SeqCst)
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
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut st = LoopState::new(&self.cfg);
        info!("win_bet_loop_started");
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
            self.exposed_flag
                .store(!st.exposures.is_empty(), Ordering::SeqCst);
            self.metrics
                .open_exposures
                .store(st.exposures.len() as u64, Ordering::Relaxed);
        }
        info!(metrics = %self.metrics.summary(), "win_bet_loop_exit");
    }

    // ------------------------------------------------------------------
    // Cycle control
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
                st.sampler.clear();
                st.stability.clear();
                st.entry = None;
                st.exposures.clear();
                st.hedge_index.clear();
                st.inventory = [0.0, 0.0];
                info!(slug = %new.slug, "win_bet_cycle_reset");
            }
        }
    }

    // ------------------------------------------------------------------
    // Signal path
    // ------------------------------------------------------------------

    fn on_price(&self, event: &PriceChangedEvent, st: &mut LoopState) {
        self.metrics.signals.fetch_add(1, Ordering::Relaxed);
        let now = now_ms();
        st.sampler.add(event.token, event.price_cents, event.timestamp_ms);
        let snapshot = self.book.load();
        st.stability.observe(&snapshot, now);

        let Some(market) = st.market.clone() else {
            return;
        };
        if st.entry.is_some() {
            return; // at most one in-flight entry
        }

        // Gates, in order. Any failure skips this tick.
        let q = quality::evaluate(&snapshot, now, &self.cfg.quality, false);
        if !q.tradable(self.cfg.min_quality_score) {
            self.skip("quality");
            return;
        }
        let verdict = st.stability.assess(now);
        if !verdict.stable {
            self.skip(verdict.reason.unwrap_or("unstable"));
            return;
        }
        if !st.cycle.warmup_elapsed(now, self.cfg.warmup_ms) {
            self.skip("warmup");
            return;
        }
        if !st.cycle.cooldown_elapsed(now, self.cfg.cooldown_ms) {
            self.skip("cooldown");
            return;
        }
        if st.cycle.trades_this_cycle >= self.cfg.max_trades_per_cycle {
            self.skip("trade_cap");
            return;
        }
        if market.seconds_remaining(now_secs()) <= self.cfg.end_protect_secs {
            self.skip("end_protect");
            return;
        }
        if !st.exposures.is_empty() {
            self.skip("unhedged_risk");
            return;
        }
        if let Some(last) = st.per_market_last_ms.get(&market.slug) {
            if now - last < self.cfg.per_market_cooldown_ms {
                self.skip("per_market_cooldown");
                return;
            }
        }

        let Some(token) = self.pick_direction(st, now, &snapshot) else {
            return;
        };
        if st.skew(token) > self.cfg.inventory_skew_threshold {
            self.skip("inventory_skew");
            return;
        }

        // Execution: entry ask + complementary hedge limit.
        let entry_ask = snapshot.ask(token);
        let hedge_token = token.complement();
        let hedge_ask = snapshot.ask(hedge_token);
        if entry_ask <= 0 || hedge_ask <= 0 {
            self.skip("no_taker_price");
            return;
        }
        let mut hedge_limit = 100 - entry_ask - self.cfg.hedge_offset_cents;
        if hedge_limit >= hedge_ask {
            // Stay a maker on the hedge side.
            hedge_limit = hedge_ask - 1;
        }
        if hedge_limit <= 0 {
            self.skip("hedge_unpriceable");
            return;
        }

        let mut size = self.cfg.entry_size;
        for price in [entry_ask, hedge_limit] {
            let min_size = self.cfg.min_notional_usd * 100.0 / price as f64;
            if size < min_size {
                size = (min_size * 100.0).ceil() / 100.0;
            }
        }
        let size = quantize_size(size, &[entry_ask, hedge_limit]);
        if size <= 0.0 {
            self.skip("size_unrepresentable");
            return;
        }

        let order = Order::request(
            market.slug.clone(),
            market.asset_id(token).to_string(),
            Some(token),
            Side::Buy,
            entry_ask,
            size,
            OrderType::Fak,
        )
        .entry();

        st.entry = Some(EntryPending {
            order_id: String::new(),
            token,
            entry_ask,
            hedge_limit,
            size,
            deadline_ms: now + self.cfg.entry_fill_max_wait_ms,
            next_poll_ms: now + self.cfg.entry_fill_check_interval_ms,
            awaiting_hedge_ack: false,
        });
        st.cycle.record_trigger(now);
        st.per_market_last_ms.insert(market.slug.clone(), now);
        self.metrics.entries_placed.fetch_add(1, Ordering::Relaxed);
        info!(%token, entry_ask, hedge_limit, size, "win_bet_entry");

        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let cmd = Command::new("win_bet_entry", ORDER_TIMEOUT, async move {
            let result = trading.place_order(order).await;
            let _ = tx.try_send(CmdResult::EntryPlaced { result });
        });
        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            st.entry = None;
        }
    }

    /// Velocity + move thresholds, strictly upward; `prefer_higher_price`
    /// breaks double qualification.
    fn pick_direction(
        &self,
        st: &mut LoopState,
        now: i64,
        snapshot: &crate::market::best_book::BestBookSnapshot,
    ) -> Option<TokenKind> {
        let mut qualified: Vec<TokenKind> = Vec::with_capacity(2);
        for token in TokenKind::BOTH {
            let stats = st.sampler.stats(token, now);
            if stats.ok
                && stats.delta_cents > 0
                && stats.abs_move_cents >= self.cfg.min_move_cents
                && stats.velocity_cents_per_sec >= self.cfg.min_velocity_cents_per_sec
            {
                qualified.push(token);
            }
        }
        match qualified.len() {
            0 => None,
            1 => Some(qualified[0]),
            _ => {
                if self.cfg.prefer_higher_price {
                    // Symmetric books tie on velocity often; the richer side
                    // has the better conditional win rate.
                    if snapshot.ask(TokenKind::Up) >= snapshot.ask(TokenKind::Down) {
                        Some(TokenKind::Up)
                    } else {
                        Some(TokenKind::Down)
                    }
                } else {
                    Some(qualified[0])
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Command results
    // ------------------------------------------------------------------

    fn on_cmd_result(&self, result: CmdResult, st: &mut LoopState) {
        match result {
            CmdResult::EntryPlaced { result } => self.on_entry_placed(result, st),
            CmdResult::EntryPoll { order_id, result } => {
                if let Ok(Some(order)) = result {
                    if order.order_id == order_id {
                        self.track_entry_progress(&order, st);
                    }
                }
            }
            CmdResult::HedgePlaced { entry_id, result } => {
                self.on_hedge_placed(&entry_id, result, st)
            }
            CmdResult::AggressivePlaced { entry_id, result } => {
                self.on_aggressive_placed(&entry_id, result, st)
            }
            CmdResult::HedgeQuote {
                entry_id,
                kind,
                result,
            } => self.on_hedge_quote(&entry_id, kind, result, st),
            CmdResult::HedgePoll { entry_id, result } => {
                self.on_hedge_poll(&entry_id, result, st)
            }
            CmdResult::CancelDone { order_id, ok } => {
                if !ok {
                    warn!(order_id = %order_id, "win_bet_cancel_request_failed");
                }
            }
        }
    }

    fn on_entry_placed(&self, result: Result<Order>, st: &mut LoopState) {
        let order = match result {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "win_bet_entry_place_failed");
                self.metrics.entries_missed.fetch_add(1, Ordering::Relaxed);
                st.entry = None;
                return;
            }
        };
        if let Some(entry) = st.entry.as_mut() {
            entry.order_id = order.order_id.clone();
        }
        self.track_entry_progress(&order, st);
    }

    /// Advance the pending entry from an ack, poll, or stream update.
    fn track_entry_progress(&self, order: &Order, st: &mut LoopState) {
        let Some(entry) = st.entry.clone() else {
            return;
        };
        if entry.awaiting_hedge_ack || order.order_id != entry.order_id {
            return;
        }
        if order.filled_size > FILL_TOLERANCE {
            self.on_entry_filled(order, st);
        } else if order.status.is_terminal() {
            // FAK missed entirely.
            debug!(order_id = %order.order_id, status = %order.status, "win_bet_entry_missed");
            self.metrics.entries_missed.fetch_add(1, Ordering::Relaxed);
            st.entry = None;
        }
    }

    /// Confirmed entry fill: place the complementary GTC hedge. The hedge
    /// bypasses risk-off so a pause can never strand a naked entry.
    fn on_entry_filled(&self, order: &Order, st: &mut LoopState) {
        let Some(entry) = st.entry.as_mut() else {
            return;
        };
        entry.awaiting_hedge_ack = true;
        let entry_snapshot = entry.clone();
        self.metrics.entries_filled.fetch_add(1, Ordering::Relaxed);
        st.inventory[entry_snapshot.token.index()] += order.filled_size;

        let Some(market) = st.market.clone() else {
            return;
        };
        let hedge_token = entry_snapshot.token.complement();
        let hedge = Order::request(
            market.slug.clone(),
            market.asset_id(hedge_token).to_string(),
            Some(hedge_token),
            Side::Buy,
            entry_snapshot.hedge_limit,
            order.filled_size,
            OrderType::Gtc,
        )
        .bypassing_risk_off();

        info!(
            entry_id = %order.order_id,
            hedge_limit = entry_snapshot.hedge_limit,
            size = order.filled_size,
            "win_bet_hedge_placing"
        );

        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let entry_id = order.order_id.clone();
        let cmd = Command::new("win_bet_hedge", ORDER_TIMEOUT, async move {
            let result = trading.place_order(hedge).await;
            let _ = tx.try_send(CmdResult::HedgePlaced { entry_id, result });
        });

        let entry_price = order.filled_price_cents.unwrap_or(entry_snapshot.entry_ask);
        let exposure = HedgeExposure {
            entry_order_id: order.order_id.clone(),
            hedge_order_id: String::new(),
            entry_token: entry_snapshot.token,
            hedge_token,
            entry_filled_at_ms: order.filled_at_ms.unwrap_or_else(now_ms),
            entry_filled_size: order.filled_size,
            entry_price_cents: entry_price,
            last_hedge_cents: entry_snapshot.hedge_limit,
            original_hedge_cents: entry_snapshot.hedge_limit,
            hedge_placed_at_ms: now_ms(),
            state: HedgeState::NeedsPlacement,
        };
        st.exposures.insert(order.order_id.clone(), exposure);

        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            // Exposure stays in NeedsPlacement; the monitor retries.
        }
        st.entry = None;
    }

    fn on_hedge_placed(&self, entry_id: &str, result: Result<Order>, st: &mut LoopState) {
        let Some(exposure) = st.exposures.get_mut(entry_id) else {
            return;
        };
        match result {
            Ok(order) => {
                if order.status == OrderStatus::Filled {
                    // Crossed immediately at placement.
                    st.hedge_index
                        .insert(order.order_id.clone(), entry_id.to_string());
                    self.resolve_exposure(entry_id, &order, st);
                    return;
                }
                exposure.hedge_order_id = order.order_id.clone();
                exposure.hedge_placed_at_ms = now_ms();
                exposure.last_hedge_cents = order.price_cents;
                exposure.state = HedgeState::Resting;
                st.hedge_index
                    .insert(order.order_id, entry_id.to_string());
                self.metrics.hedges_placed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(entry_id, error = %e, "win_bet_hedge_place_failed");
                exposure.state = HedgeState::NeedsPlacement;
            }
        }
    }

    fn on_aggressive_placed(&self, entry_id: &str, result: Result<Order>, st: &mut LoopState) {
        match result {
            Ok(order) if order.filled_size > FILL_TOLERANCE => {
                st.hedge_index
                    .insert(order.order_id.clone(), entry_id.to_string());
                self.resolve_exposure(entry_id, &order, st);
            }
            Ok(order) => {
                debug!(entry_id, order_id = %order.order_id, "win_bet_aggressive_missed");
                if let Some(exposure) = st.exposures.get_mut(entry_id) {
                    exposure.state = HedgeState::NeedsPlacement;
                }
            }
            Err(e) => {
                warn!(entry_id, error = %e, "win_bet_aggressive_failed");
                if let Some(exposure) = st.exposures.get_mut(entry_id) {
                    exposure.state = HedgeState::NeedsPlacement;
                }
            }
        }
    }

    fn on_hedge_quote(
        &self,
        entry_id: &str,
        kind: EscalationKind,
        result: Result<TopOfBook>,
        st: &mut LoopState,
    ) {
        let Some(market) = st.market.clone() else {
            return;
        };
        let Some(exposure) = st.exposures.get_mut(entry_id) else {
            return;
        };
        if exposure.state != (HedgeState::AwaitRequote { kind }) {
            return;
        }
        let tob = match result {
            Ok(t) => t,
            Err(e) => {
                debug!(entry_id, error = %e, "win_bet_hedge_quote_failed");
                exposure.state = HedgeState::NeedsPlacement;
                return;
            }
        };
        let hedge_ask = tob.ask(exposure.hedge_token);
        if hedge_ask <= 0 {
            exposure.state = HedgeState::NeedsPlacement;
            return;
        }

        match kind {
            EscalationKind::Reorder => {
                // Same complementary invariant as the original placement.
                let mut limit =
                    100 - exposure.entry_price_cents - self.cfg.hedge_offset_cents;
                if limit >= hedge_ask {
                    limit = hedge_ask - 1;
                }
                if limit <= 0 {
                    exposure.state = HedgeState::NeedsPlacement;
                    return;
                }
                let hedge = Order::request(
                    market.slug.clone(),
                    market.asset_id(exposure.hedge_token).to_string(),
                    Some(exposure.hedge_token),
                    Side::Buy,
                    limit,
                    exposure.entry_filled_size,
                    OrderType::Gtc,
                )
                .bypassing_risk_off();
                self.metrics.hedge_reorders.fetch_add(1, Ordering::Relaxed);
                info!(entry_id, limit, "win_bet_hedge_reorder");

                let trading = self.trading.clone();
                let tx = self.result_tx.clone();
                let entry_id = entry_id.to_string();
                let cmd = Command::new("win_bet_hedge_reorder", ORDER_TIMEOUT, async move {
                    let result = trading.place_order(hedge).await;
                    let _ = tx.try_send(CmdResult::HedgePlaced { entry_id, result });
                });
                if !self.executor.submit(cmd) {
                    self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
                    exposure.state = HedgeState::NeedsPlacement;
                }
            }
            EscalationKind::Aggressive => {
                // Taker buy at the current ask, bounded by the worst loss we
                // will absorb on the complete set.
                let cap = 100 - exposure.entry_price_cents + self.cfg.max_acceptable_loss_cents;
                let limit = hedge_ask.min(cap).min(99);
                if limit <= 0 {
                    exposure.state = HedgeState::NeedsPlacement;
                    return;
                }
                let hedge = Order::request(
                    market.slug.clone(),
                    market.asset_id(exposure.hedge_token).to_string(),
                    Some(exposure.hedge_token),
                    Side::Buy,
                    limit,
                    exposure.entry_filled_size,
                    OrderType::Fak,
                )
                .bypassing_risk_off();
                self.metrics
                    .aggressive_escalations
                    .fetch_add(1, Ordering::Relaxed);
                warn!(entry_id, limit, hedge_ask, "win_bet_hedge_aggressive_fak");

                let trading = self.trading.clone();
                let tx = self.result_tx.clone();
                let entry_id = entry_id.to_string();
                let cmd = Command::new("win_bet_hedge_aggressive", ORDER_TIMEOUT, async move {
                    let result = trading.place_order(hedge).await;
                    let _ = tx.try_send(CmdResult::AggressivePlaced { entry_id, result });
                });
                if !self.executor.submit(cmd) {
                    self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
                    exposure.state = HedgeState::NeedsPlacement;
                }
            }
        }
    }

    fn on_hedge_poll(&self, entry_id: &str, result: Result<Option<Order>>, st: &mut LoopState) {
        let Some(exposure) = st.exposures.get(entry_id).cloned() else {
            return;
        };
        let HedgeState::CancelPending { kind, .. } = exposure.state else {
            return;
        };
        match result {
            Ok(Some(order)) => {
                if order.filled_size > FILL_TOLERANCE && order.status == OrderStatus::Filled {
                    // Hedge filled while we tried to cancel: resolved.
                    self.resolve_exposure(entry_id, &order, st);
                } else if order.status == OrderStatus::Canceled
                    || order.status == OrderStatus::Failed
                {
                    self.on_cancel_confirmed(entry_id, kind, st);
                }
                // Still live: keep polling.
            }
            // Order not found counts as confirmation.
            Ok(None) => self.on_cancel_confirmed(entry_id, kind, st),
            Err(e) => debug!(entry_id, error = %e, "win_bet_hedge_poll_failed"),
        }
    }

    /// Cancel evidence observed (Canceled status or order gone). Only now
    /// may a replacement order be quoted.
    fn on_cancel_confirmed(&self, entry_id: &str, kind: EscalationKind, st: &mut LoopState) {
        let Some(market) = st.market.clone() else {
            return;
        };
        let Some(exposure) = st.exposures.get_mut(entry_id) else {
            return;
        };
        if !matches!(exposure.state, HedgeState::CancelPending { .. }) {
            return;
        }
        st.hedge_index.remove(&exposure.hedge_order_id);
        exposure.hedge_order_id = String::new();
        exposure.state = HedgeState::AwaitRequote { kind };
        debug!(entry_id, ?kind, "win_bet_cancel_confirmed");

        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let captured_id = entry_id.to_string();
        let cmd = Command::new("win_bet_hedge_quote", QUOTE_TIMEOUT, async move {
            let result = trading.get_top_of_book(&market).await;
            let _ = tx.try_send(CmdResult::HedgeQuote {
                entry_id: captured_id,
                kind,
                result,
            });
        });
        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            if let Some(exposure) = st.exposures.get_mut(entry_id) {
                exposure.state = HedgeState::NeedsPlacement;
            }
        }
    }

    fn resolve_exposure(&self, entry_id: &str, hedge_order: &Order, st: &mut LoopState) {
        let mut hedge_token = hedge_order.token;
        if let Some(exposure) = st.exposures.remove(entry_id) {
            st.hedge_index.remove(&exposure.hedge_order_id);
            hedge_token = hedge_token.or(Some(exposure.hedge_token));
        }
        st.hedge_index.remove(&hedge_order.order_id);
        if let Some(token) = hedge_token {
            st.inventory[token.index()] += hedge_order.filled_size;
        }
        self.metrics.exposures_resolved.fetch_add(1, Ordering::Relaxed);
        info!(
            entry_id,
            hedge_id = %hedge_order.order_id,
            hedge_price = hedge_order.filled_price_cents.unwrap_or(hedge_order.price_cents),
            "win_bet_exposure_resolved"
        );
    }

    // ------------------------------------------------------------------
    // Order updates from the session
    // ------------------------------------------------------------------

    fn on_order_update(&self, order: &Order, st: &mut LoopState) {
        // Entry progress.
        if st
            .entry
            .as_ref()
            .map(|e| e.order_id == order.order_id)
            .unwrap_or(false)
        {
            self.track_entry_progress(order, st);
            return;
        }
        // Hedge lifecycle.
        let Some(entry_id) = st.hedge_index.get(&order.order_id).cloned() else {
            return;
        };
        if order.status == OrderStatus::Filled && order.filled_size > FILL_TOLERANCE {
            self.resolve_exposure(&entry_id, order, st);
            return;
        }
        if order.status == OrderStatus::Canceled {
            let kind = match st.exposures.get(&entry_id).map(|e| e.state) {
                Some(HedgeState::CancelPending { kind, .. }) => Some(kind),
                _ => None,
            };
            if let Some(kind) = kind {
                self.on_cancel_confirmed(&entry_id, kind, st);
            }
        }
    }

    // ------------------------------------------------------------------
    // Monitor tick
    // ------------------------------------------------------------------

    fn on_tick(&self, st: &mut LoopState) {
        let now = now_ms();
        self.poll_entry(now, st);

        let entry_ids: Vec<String> = st.exposures.keys().cloned().collect();
        for entry_id in entry_ids {
            let Some(exposure) = st.exposures.get(&entry_id).cloned() else {
                continue;
            };
            match exposure.state {
                HedgeState::NeedsPlacement => {
                    // Re-quote through the reorder path.
                    if let Some(e) = st.exposures.get_mut(&entry_id) {
                        e.state = HedgeState::CancelPending {
                            kind: EscalationKind::Reorder,
                            requested_at_ms: now,
                            next_poll_ms: now,
                        };
                    }
                    // No live order to cancel: confirmation is immediate.
                    self.on_cancel_confirmed(&entry_id, EscalationKind::Reorder, st);
                }
                HedgeState::Resting => {
                    let exposure_age = now - exposure.entry_filled_at_ms;
                    let resting_age = now - exposure.hedge_placed_at_ms;
                    if exposure_age >= self.cfg.aggressive_hedge_timeout_secs * 1000 {
                        self.request_hedge_cancel(&entry_id, EscalationKind::Aggressive, now, st);
                    } else if resting_age >= self.cfg.hedge_reorder_timeout_secs * 1000 {
                        self.request_hedge_cancel(&entry_id, EscalationKind::Reorder, now, st);
                    }
                }
                HedgeState::CancelPending {
                    kind,
                    requested_at_ms,
                    next_poll_ms,
                } => {
                    if now - requested_at_ms > self.cfg.cancel_confirm_timeout_ms {
                        // No confirmation inside the window: never place the
                        // replacement blind. Back off to Resting and retry.
                        warn!(entry_id = %entry_id, "win_bet_cancel_confirm_timeout");
                        if let Some(e) = st.exposures.get_mut(&entry_id) {
                            e.state = HedgeState::Resting;
                            e.hedge_placed_at_ms = now;
                        }
                    } else if now >= next_poll_ms {
                        if let Some(e) = st.exposures.get_mut(&entry_id) {
                            e.state = HedgeState::CancelPending {
                                kind,
                                requested_at_ms,
                                next_poll_ms: now + self.cfg.cancel_confirm_poll_ms,
                            };
                        }
                        self.poll_hedge(&entry_id, &exposure.hedge_order_id);
                    }
                }
                HedgeState::AwaitRequote { .. } => {}
            }
        }
    }

    fn poll_entry(&self, now: i64, st: &mut LoopState) {
        let Some(entry) = st.entry.clone() else {
            return;
        };
        if entry.awaiting_hedge_ack || entry.order_id.is_empty() {
            return;
        }
        if now >= entry.deadline_ms {
            info!(order_id = %entry.order_id, "win_bet_entry_wait_expired");
            self.metrics.entries_missed.fetch_add(1, Ordering::Relaxed);
            let trading = self.trading.clone();
            let tx = self.result_tx.clone();
            let order_id = entry.order_id.clone();
            let cmd = Command::new("win_bet_entry_cancel", ORDER_TIMEOUT, async move {
                let ok = trading.cancel_order(&order_id).await.is_ok();
                let _ = tx.try_send(CmdResult::CancelDone { order_id, ok });
            });
            if !self.executor.submit(cmd) {
                self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            }
            st.entry = None;
            return;
        }
        if now >= entry.next_poll_ms {
            if let Some(e) = st.entry.as_mut() {
                e.next_poll_ms = now + self.cfg.entry_fill_check_interval_ms;
            }
            let trading = self.trading.clone();
            let tx = self.result_tx.clone();
            let order_id = entry.order_id.clone();
            let cmd = Command::new("win_bet_entry_poll", QUOTE_TIMEOUT, async move {
                let result = trading.get_order(&order_id).await;
                let _ = tx.try_send(CmdResult::EntryPoll { order_id, result });
            });
            if !self.executor.submit(cmd) {
                self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn request_hedge_cancel(
        &self,
        entry_id: &str,
        kind: EscalationKind,
        now: i64,
        st: &mut LoopState,
    ) {
        let Some(exposure) = st.exposures.get_mut(entry_id) else {
            return;
        };
        let hedge_id = exposure.hedge_order_id.clone();
        if hedge_id.is_empty() {
            exposure.state = HedgeState::NeedsPlacement;
            return;
        }
        exposure.state = HedgeState::CancelPending {
            kind,
            requested_at_ms: now,
            next_poll_ms: now + self.cfg.cancel_confirm_poll_ms,
        };
        info!(entry_id, hedge_id = %hedge_id, ?kind, "win_bet_hedge_cancel");

        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let cmd = Command::new("win_bet_hedge_cancel", ORDER_TIMEOUT, async move {
            let ok = trading.cancel_order(&hedge_id).await.is_ok();
            let _ = tx.try_send(CmdResult::CancelDone {
                order_id: hedge_id,
                ok,
            });
        });
        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn poll_hedge(&self, entry_id: &str, hedge_id: &str) {
        let trading = self.trading.clone();
        let tx = self.result_tx.clone();
        let entry_id = entry_id.to_string();
        let hedge_id = hedge_id.to_string();
        let cmd = Command::new("win_bet_hedge_poll", QUOTE_TIMEOUT, async move {
            let result = trading.get_order(&hedge_id).await;
            let _ = tx.try_send(CmdResult::HedgePoll { entry_id, result });
        });
        if !self.executor.submit(cmd) {
            self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn skip(&self, reason: &'static str) {
        self.metrics.gate_skips.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "win_bet_skip");
    }
}

/// Largest size not above `size` whose notional is representable on the
/// 2-decimal USD grid for every given price. Falls back to whole shares.
fn quantize_size(size: f64, prices: &[i64]) -> f64 {
    let mut candidate = (size * 100.0).floor() / 100.0;
    for _ in 0..100 {
        if candidate <= 0.0 {
            break;
        }
        let representable = prices.iter().all(|p| {
            let cents = candidate * *p as f64;
            (cents - cents.round()).abs() < 1e-6
        });
        if representable {
            return candidate;
        }
        candidate = ((candidate * 100.0).round() - 1.0) / 100.0;
    }
    size.floor().max(0.0)
}

impl Strategy for WinBetStrategy {
    fn name(&self) -> &'static str {
        "win_bet"
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
    use crate::models::scale_size;

    struct Rig {
        strategy: Arc<WinBetStrategy>,
        trading: Arc<PaperTradingService>,
        book: Arc<AtomicBestBook>,
        market: Arc<Market>,
        result_rx: mpsc::Receiver<CmdResult>,
        st: LoopState,
    }

    fn test_cfg() -> WinBetConfig {
        WinBetConfig {
            warmup_ms: 0,
            cooldown_ms: 0,
            per_market_cooldown_ms: 0,
            stability: StabilityConfig {
                min_samples: 1,
                ..StabilityConfig::default()
            },
            ..WinBetConfig::default()
        }
    }

    fn rig(cfg: WinBetConfig) -> Rig {
        let book = Arc::new(AtomicBestBook::new());
        // S3 book: UP 54/55, DOWN 43/44. Mirror 55 + 44 = 99.
        book.update_token(TokenKind::Up, 54, 55, scale_size(50.0), scale_size(50.0));
        book.update_token(TokenKind::Down, 43, 44, scale_size(50.0), scale_size(50.0));
        let trading = PaperTradingService::new(book.clone());
        let market = Arc::new(Market::new(
            format!("btc-updown-15m-{}", now_secs() - 60),
            "0xcond",
            "yes-asset",
            "no-asset",
        ));
        trading.set_current_market_info(market.clone());
        let executor = CommandExecutor::spawn(ExecutionMode::Serial, 256);
        let strategy = WinBetStrategy::new(cfg.clone(), trading.clone(), executor, book.clone());
        let result_rx = strategy.result_rx.lock().take().unwrap();
        let mut st = LoopState::new(&cfg);
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

    fn feed_up_ramp(rig: &mut Rig) {
        // UP mids rising 51 -> 55 over ~10s: delta +4, velocity 0.4 c/s.
        let now = now_ms();
        for (i, px) in [(10i64, 51i64), (7, 52), (5, 53), (2, 54), (0, 55)] {
            let ev = PriceChangedEvent {
                market: rig.market.clone(),
                token: TokenKind::Up,
                price_cents: px,
                timestamp_ms: now - i * 1000,
            };
            rig.strategy.on_price(&ev, &mut rig.st);
        }
    }

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
    async fn test_velocity_trigger_places_entry_and_hedge() {
        let mut r = rig(test_cfg());
        feed_up_ramp(&mut r);
        assert!(r.st.entry.is_some() || !r.st.exposures.is_empty());
        pump(&mut r).await;

        // Entry filled FAK at 55; hedge GTC resting.
        assert!(r.st.entry.is_none());
        assert_eq!(r.st.exposures.len(), 1);
        let exposure = r.st.exposures.values().next().unwrap();
        assert_eq!(exposure.entry_token, TokenKind::Up);
        assert_eq!(exposure.entry_price_cents, 55);
        // hedge limit = 100 - 55 - 1 = 44, clamped below no_ask 44 -> 43.
        assert_eq!(exposure.original_hedge_cents, 43);
        assert_eq!(exposure.state, HedgeState::Resting);
        assert_eq!(r.st.cycle.trades_this_cycle, 1);

        // Hedge-pricing invariant.
        assert!(exposure.entry_price_cents + exposure.original_hedge_cents <= 100 - 1);
        assert!(exposure.original_hedge_cents < 44);
    }

    #[tokio::test]
    async fn test_hedge_fill_resolves_exposure() {
        let mut r = rig(test_cfg());
        feed_up_ramp(&mut r);
        pump(&mut r).await;
        assert_eq!(r.st.exposures.len(), 1);
        let hedge_id = r
            .st
            .exposures
            .values()
            .next()
            .unwrap()
            .hedge_order_id
            .clone();

        // The DOWN ask drops through the hedge limit; the paper venue
        // cranks the resting GTC to a fill and we replay the update.
        r.book.update_token(TokenKind::Down, 41, 42, 0, 0);
        r.trading.crank();
        let filled = r.trading.get_order(&hedge_id).await.unwrap().unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        r.strategy.on_order_update(&filled, &mut r.st);

        assert!(r.st.exposures.is_empty());
        assert_eq!(
            r.strategy.metrics().exposures_resolved.load(Ordering::Relaxed),
            1
        );
        // Both legs in inventory now.
        assert!((r.st.inventory[0] - 5.0).abs() < 1e-9);
        assert!((r.st.inventory[1] - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unhedged_risk_gate_blocks_new_entries() {
        let mut r = rig(test_cfg());
        feed_up_ramp(&mut r);
        pump(&mut r).await;
        assert_eq!(r.st.exposures.len(), 1);

        let skips = r.strategy.metrics().gate_skips.load(Ordering::Relaxed);
        feed_up_ramp(&mut r);
        assert!(r.st.entry.is_none());
        assert!(r.strategy.metrics().gate_skips.load(Ordering::Relaxed) > skips);
    }

    #[tokio::test]
    async fn test_aggressive_escalation_waits_for_cancel_confirmation() {
        // S4: hedge unfilled past the aggressive timeout; the FAK replaces
        // it only after the cancel is confirmed.
        let mut r = rig(WinBetConfig {
            aggressive_hedge_timeout_secs: 60,
            ..test_cfg()
        });
        feed_up_ramp(&mut r);
        pump(&mut r).await;
        let entry_id = r.st.exposures.keys().next().unwrap().clone();
        let hedge_id = r.st.exposures[&entry_id].hedge_order_id.clone();

        // Market moved: the DOWN ask now sits at 46.
        r.book
            .update_token(TokenKind::Down, 45, 46, scale_size(50.0), scale_size(50.0));

        // Backdate the entry fill past the aggressive timeout.
        r.st.exposures.get_mut(&entry_id).unwrap().entry_filled_at_ms = now_ms() - 61_000;
        r.strategy.on_tick(&mut r.st);
        assert!(matches!(
            r.st.exposures[&entry_id].state,
            HedgeState::CancelPending {
                kind: EscalationKind::Aggressive,
                ..
            }
        ));
        // Cancel request lands on the paper venue.
        pump(&mut r).await;

        // The old hedge must be canceled before any FAK goes out.
        let old_hedge = r.trading.get_order(&hedge_id).await.unwrap().unwrap();
        assert_eq!(old_hedge.status, OrderStatus::Canceled);

        // Poll -> confirmation -> quote -> aggressive FAK at ask 46.
        r.st.exposures.get_mut(&entry_id).unwrap().state = match r.st.exposures[&entry_id].state {
            HedgeState::CancelPending { kind, requested_at_ms, .. } => HedgeState::CancelPending {
                kind,
                requested_at_ms,
                next_poll_ms: now_ms(),
            },
            other => other,
        };
        r.strategy.on_tick(&mut r.st);
        pump(&mut r).await;

        assert!(r.st.exposures.is_empty(), "exposure resolved by FAK");
        assert_eq!(
            r.strategy
                .metrics()
                .aggressive_escalations
                .load(Ordering::Relaxed),
            1
        );
        // The taker fill cost 46c: loss bound respected
        // (55 + 46 = 101 <= 100 + max_acceptable_loss).
        let positions = r
            .trading
            .get_open_positions_for_market(&r.market.slug)
            .await
            .unwrap();
        assert_eq!(positions.len(), 2);
    }

    #[tokio::test]
    async fn test_reorder_keeps_complementary_invariant() {
        let mut r = rig(WinBetConfig {
            hedge_reorder_timeout_secs: 30,
            aggressive_hedge_timeout_secs: 600,
            ..test_cfg()
        });
        feed_up_ramp(&mut r);
        pump(&mut r).await;
        let entry_id = r.st.exposures.keys().next().unwrap().clone();

        // Resting past the reorder timeout.
        {
            let e = r.st.exposures.get_mut(&entry_id).unwrap();
            e.hedge_placed_at_ms = now_ms() - 31_000;
        }
        r.strategy.on_tick(&mut r.st);
        pump(&mut r).await; // cancel lands

        // Force the poll due and run the confirm -> requote -> replace chain.
        if let Some(e) = r.st.exposures.get_mut(&entry_id) {
            if let HedgeState::CancelPending { kind, requested_at_ms, .. } = e.state {
                e.state = HedgeState::CancelPending {
                    kind,
                    requested_at_ms,
                    next_poll_ms: now_ms(),
                };
            }
        }
        r.strategy.on_tick(&mut r.st);
        pump(&mut r).await;

        let exposure = &r.st.exposures[&entry_id];
        assert_eq!(exposure.state, HedgeState::Resting);
        assert_eq!(
            r.strategy.metrics().hedge_reorders.load(Ordering::Relaxed),
            1
        );
        // New GTC still satisfies entry + hedge <= 100 - offset and maker
        // constraint.
        assert!(exposure.entry_price_cents + exposure.last_hedge_cents <= 99);
        assert!(exposure.last_hedge_cents < 44);
        assert!(!exposure.hedge_order_id.is_empty());
    }

    #[tokio::test]
    async fn test_prefer_higher_price_tiebreak() {
        let mut r = rig(test_cfg());
        // Both sides ramp identically.
        let now = now_ms();
        for (i, px) in [(9i64, 50i64), (6, 52), (3, 53), (0, 54)] {
            for token in TokenKind::BOTH {
                let ev = PriceChangedEvent {
                    market: r.market.clone(),
                    token,
                    price_cents: px,
                    timestamp_ms: now - i * 1000,
                };
                r.st.sampler.add(token, ev.price_cents, ev.timestamp_ms);
            }
        }
        let snapshot = r.book.load();
        let picked = r.strategy.pick_direction(&mut r.st, now, &snapshot);
        // UP ask (55) > DOWN ask (44): higher-priced side wins the tie.
        assert_eq!(picked, Some(TokenKind::Up));
    }

    #[tokio::test]
    async fn test_downward_move_never_qualifies() {
        let mut r = rig(test_cfg());
        let now = now_ms();
        for (i, px) in [(9i64, 55i64), (6, 53), (3, 52), (0, 50)] {
            r.st.sampler.add(TokenKind::Up, px, now - i * 1000);
        }
        let snapshot = r.book.load();
        assert_eq!(r.strategy.pick_direction(&mut r.st, now, &snapshot), None);
    }

    #[tokio::test]
    async fn test_end_protect_and_trade_cap_gates() {
        // Market with under two minutes left.
        let mut r = rig(test_cfg());
        let ending = Arc::new(Market::new(
            format!("btc-updown-15m-{}", now_secs() - 800),
            "0xcond",
            "yes-asset",
            "no-asset",
        ));
        r.strategy.on_ctrl(CtrlMsg::Cycle { new: ending }, &mut r.st);
        feed_up_ramp(&mut r);
        assert!(r.st.entry.is_none());

        // Trade cap.
        let mut r = rig(WinBetConfig {
            max_trades_per_cycle: 0,
            ..test_cfg()
        });
        feed_up_ramp(&mut r);
        assert!(r.st.entry.is_none());
    }

    #[tokio::test]
    async fn test_inventory_skew_gate() {
        let mut r = rig(WinBetConfig {
            inventory_skew_threshold: 10.0,
            ..test_cfg()
        });
        r.st.inventory[TokenKind::Up.index()] = 20.0;
        feed_up_ramp(&mut r);
        // UP direction detected but refused: it is the skewed side.
        assert!(r.st.entry.is_none());
    }

    #[tokio::test]
    async fn test_quality_gate_blocks_on_bad_book() {
        let mut r = rig(test_cfg());
        // Cross the UP book: quality scores far below 60.
        r.book.update_token(TokenKind::Up, 60, 55, 0, 0);
        feed_up_ramp(&mut r);
        assert!(r.st.entry.is_none());
    }

    #[test]
    fn test_quantize_size() {
        // Integer sizes always work.
        assert_eq!(quantize_size(5.0, &[55, 43]), 5.0);
        // 1.25 * 48c = 60 cents exactly.
        assert_eq!(quantize_size(1.25, &[48]), 1.25);
        // Falls down to a representable step.
        let q = quantize_size(1.23, &[48]);
        let cents = q * 48.0;
        assert!((cents - cents.round()).abs() < 1e-6);
        assert!(q <= 1.23);
    }

    #[tokio::test]
    async fn test_cycle_reset_clears_exposures_and_inventory() {
        let mut r = rig(test_cfg());
        feed_up_ramp(&mut r);
        pump(&mut r).await;
        assert!(!r.st.exposures.is_empty());

        let next = Arc::new(Market::new(
            format!("btc-updown-15m-{}", now_secs()),
            "0xcond2",
            "yes-2",
            "no-2",
        ));
        r.strategy.on_ctrl(CtrlMsg::Cycle { new: next }, &mut r.st);
        assert!(r.st.exposures.is_empty());
        assert_eq!(r.st.inventory, [0.0, 0.0]);
        assert_eq!(r.st.cycle.trades_this_cycle, 0);
        assert_eq!(r.st.sampler.len(TokenKind::Up), 0);
    }
}
