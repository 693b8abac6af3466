//! Per-cycle container: one market bound to its market stream, its user
//! stream, and the strategy handler sets.
//!
//! The dispatch loop is single-threaded and cooperative. Price events
//! coalesce into latest-per-token slots (a burst collapses to one dispatch
//! per direction, Up first for determinism); order and trade events flow
//! through bounded channels. The cross-cycle filter here is the single
//! authoritative isolation point: strategies never check cycle identity.
//!
//! Close contract, in order: clear the handler lists (blocks in-flight
//! emissions from reaching stale handlers), cancel the loop, close the
//! streams. Reversing this order is a known bug class.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::market::handler_list::{Handler, HandlerList};
use crate::market::stream::MarketDataStream;
use crate::market::user_stream::UserDataStream;
use crate::models::{Market, Order, PriceChangedEvent, TokenKind, TradeUpdate};

const ORDER_CHANNEL_CAPACITY: usize = 4096;
const TRADE_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub price_dispatched: AtomicU64,
    pub price_filtered_cycle: AtomicU64,
    pub price_cached: AtomicU64,
    pub orders_forwarded: AtomicU64,
    pub orders_filtered: AtomicU64,
    pub trades_forwarded: AtomicU64,
    pub trades_filtered: AtomicU64,
    pub overflows: AtomicU64,
}

impl SessionMetrics {
    pub fn summary(&self) -> String {
        format!(
            "price_dispatched={} price_filtered_cycle={} orders_forwarded={} orders_filtered={} trades_forwarded={} overflows={}",
            self.price_dispatched.load(Ordering::Relaxed),
            self.price_filtered_cycle.load(Ordering::Relaxed),
            self.orders_forwarded.load(Ordering::Relaxed),
            self.orders_filtered.load(Ordering::Relaxed),
            self.trades_forwarded.load(Ordering::Relaxed),
            self.overflows.load(Ordering::Relaxed),
        )
    }
}

pub struct Session {
    market: ArcSwap<Market>,
    mds: Arc<MarketDataStream>,
    uds: Option<Arc<UserDataStream>>,
    price_handlers: HandlerList<PriceChangedEvent>,
    order_handlers: HandlerList<Order>,
    trade_handlers: HandlerList<TradeUpdate>,
    /// Latest-per-token slots; a batch of updates collapses to one dispatch.
    latest: Mutex<[Option<PriceChangedEvent>; 2]>,
    /// Last dispatched value per token while no handler was registered.
    cached: Mutex<[Option<PriceChangedEvent>; 2]>,
    notify: Notify,
    order_tx: mpsc::Sender<Order>,
    order_rx: Mutex<Option<mpsc::Receiver<Order>>>,
    trade_tx: mpsc::Sender<TradeUpdate>,
    trade_rx: Mutex<Option<mpsc::Receiver<TradeUpdate>>>,
    close_tx: watch::Sender<bool>,
    mds_tap: Mutex<Option<Handler<PriceChangedEvent>>>,
    metrics: SessionMetrics,
}

impl Session {
    pub fn new(
        market: Arc<Market>,
        mds: Arc<MarketDataStream>,
        uds: Option<Arc<UserDataStream>>,
    ) -> Arc<Self> {
        let (order_tx, order_rx) = mpsc::channel(ORDER_CHANNEL_CAPACITY);
        let (trade_tx, trade_rx) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
        let (close_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            market: ArcSwap::new(market),
            mds: mds.clone(),
            uds,
            price_handlers: HandlerList::new(),
            order_handlers: HandlerList::new(),
            trade_handlers: HandlerList::new(),
            latest: Mutex::new([None, None]),
            cached: Mutex::new([None, None]),
            notify: Notify::new(),
            order_tx,
            order_rx: Mutex::new(Some(order_rx)),
            trade_tx,
            trade_rx: Mutex::new(Some(trade_rx)),
            close_tx,
            mds_tap: Mutex::new(None),
            metrics: SessionMetrics::default(),
        });

        // Tap the stream's publisher. The tap only coalesces; filtering
        // happens on the dispatch side.
        let weak = Arc::downgrade(&session);
        let tap: Handler<PriceChangedEvent> = Arc::new(move |ev: &PriceChangedEvent| {
            if let Some(session) = weak.upgrade() {
                session.offer_price(ev.clone());
            }
        });
        mds.on_price_changed(tap.clone());
        *session.mds_tap.lock() = Some(tap);

        session
    }

    pub fn market(&self) -> Arc<Market> {
        self.market.load_full()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn mds(&self) -> Arc<MarketDataStream> {
        self.mds.clone()
    }

    pub fn uds(&self) -> Option<Arc<UserDataStream>> {
        self.uds.clone()
    }

    /// In-socket cycle switch: rebind this session to the next market.
    pub fn update_market(&self, market: Arc<Market>) {
        let old = self.market.swap(market.clone());
        debug!(old = %old.slug, new = %market.slug, "session_market_updated");
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a price handler. The last dispatched value per token (if
    /// any) is replayed immediately so a late registrant does not wait for
    /// the next tick of the market.
    pub fn on_price_changed(&self, handler: Handler<PriceChangedEvent>) {
        {
            let cached = self.cached.lock();
            for slot in cached.iter().flatten() {
                handler(slot);
            }
        }
        self.price_handlers.add(handler);
    }

    pub fn on_order_update(&self, handler: Handler<Order>) {
        self.order_handlers.add(handler);
    }

    pub fn on_trade_update(&self, handler: Handler<TradeUpdate>) {
        self.trade_handlers.add(handler);
    }

    // ------------------------------------------------------------------
    // Ingestion (called from stream / router contexts)
    // ------------------------------------------------------------------

    /// Coalesce one price event into its token slot.
    pub fn offer_price(&self, event: PriceChangedEvent) {
        {
            let mut latest = self.latest.lock();
            let idx = event.token.index();
            latest[idx] = Some(event);
        }
        self.notify.notify_one();
    }

    /// Entry point for the session event router. Non-blocking; overflow is
    /// logged and dropped.
    pub fn handle_order_event(&self, order: Order) {
        if let Err(err) = self.order_tx.try_send(order) {
            self.metrics.overflows.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "session_order_queue_full");
        }
    }

    pub fn handle_trade_event(&self, trade: TradeUpdate) {
        if let Err(err) = self.trade_tx.try_send(trade) {
            self.metrics.overflows.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "session_trade_queue_full");
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Swap the latest-per-token slots and dispatch, Up before Down.
    pub fn drain_latest(&self) {
        let batch = {
            let mut latest = self.latest.lock();
            std::mem::replace(&mut *latest, [None, None])
        };
        for token in TokenKind::BOTH {
            if let Some(event) = batch[token.index()].as_ref() {
                self.dispatch_price(event);
            }
        }
    }

    fn dispatch_price(&self, event: &PriceChangedEvent) {
        // The single authoritative cross-cycle check: an event stamped with
        // another cycle's market must never reach this session's handlers.
        let current = self.market.load();
        if !event.market.same_cycle(&current) {
            self.metrics
                .price_filtered_cycle
                .fetch_add(1, Ordering::Relaxed);
            trace!(
                event_slug = %event.market.slug,
                session_slug = %current.slug,
                "price_event_cross_cycle_dropped"
            );
            return;
        }

        if self.price_handlers.is_empty() {
            self.metrics.price_cached.fetch_add(1, Ordering::Relaxed);
            self.cached.lock()[event.token.index()] = Some(event.clone());
            return;
        }
        self.cached.lock()[event.token.index()] = Some(event.clone());
        self.price_handlers.emit(event);
        self.metrics.price_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Filter and forward one order event. Orders belong to this session
    /// when the slug matches exactly or the asset id is one of the pair;
    /// missing fields are populated on the way through.
    pub fn handle_order(&self, mut order: Order) {
        let market = self.market.load_full();
        let slug_match = !order.market_slug.is_empty() && order.market_slug == market.slug;
        let token = market.token_for_asset(&order.asset_id);
        if !slug_match && token.is_none() {
            self.metrics.orders_filtered.fetch_add(1, Ordering::Relaxed);
            trace!(order_id = %order.order_id, slug = %order.market_slug, "order_event_filtered");
            return;
        }
        if order.market_slug.is_empty() {
            order.market_slug = market.slug.clone();
        }
        if order.token.is_none() {
            order.token = token;
        }
        self.metrics.orders_forwarded.fetch_add(1, Ordering::Relaxed);
        self.order_handlers.emit(&order);
    }

    pub fn handle_trade(&self, mut trade: TradeUpdate) {
        let market = self.market.load_full();
        let slug_match = !trade.market_slug.is_empty() && trade.market_slug == market.slug;
        let token = market.token_for_asset(&trade.asset_id);
        if !slug_match && token.is_none() {
            self.metrics.trades_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if trade.market_slug.is_empty() {
            trade.market_slug = market.slug.clone();
        }
        self.metrics.trades_forwarded.fetch_add(1, Ordering::Relaxed);
        self.trade_handlers.emit(&trade);
    }

    /// Run the dispatch loop until close.
    pub fn spawn(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            session.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        let mut order_rx = self
            .order_rx
            .lock()
            .take()
            .expect("session loop started twice");
        let mut trade_rx = self
            .trade_rx
            .lock()
            .take()
            .expect("session loop started twice");
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(slug = %self.market().slug, "session_loop_started");
        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                _ = self.notify.notified() => self.drain_latest(),
                Some(order) = order_rx.recv() => self.handle_order(order),
                Some(trade) = trade_rx.recv() => self.handle_trade(trade),
                _ = tick.tick() => {
                    trace!(metrics = %self.metrics.summary(), "session_tick");
                }
            }
        }
        info!(slug = %self.market().slug, metrics = %self.metrics.summary(), "session_loop_exit");
    }

    /// Close in contract order: handlers, loop, streams.
    pub fn close(&self) {
        // 1. No in-flight emission may reach now-stale handlers.
        self.price_handlers.clear();
        self.order_handlers.clear();
        self.trade_handlers.clear();
        if let Some(tap) = self.mds_tap.lock().take() {
            self.mds.handlers().remove(&tap);
        }
        // 2. Cancel the dispatch loop.
        self.close_tx.send_replace(true);
        // 3. Close the transports.
        self.mds.close();
        if let Some(uds) = &self.uds {
            uds.clear_handlers();
            uds.close();
        }
        info!(slug = %self.market().slug, "session_closed");
    }
}
