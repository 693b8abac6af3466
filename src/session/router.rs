//! Single registration point for order/trade events.
//!
//! The trading service (and any live user stream) gets exactly one sink,
//! registered once per process; cycle rotation only swaps the session
//! behind it. Forwarding is unconditional here: all filtering lives in the
//! session.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::exec::trading::TradingService;
use crate::market::user_stream::UserDataStream;
use crate::models::{Order, TradeUpdate};
use crate::session::session::Session;

#[derive(Default)]
pub struct SessionEventRouter {
    current: RwLock<Option<Arc<Session>>>,
    pub forwarded_orders: AtomicU64,
    pub forwarded_trades: AtomicU64,
    pub dropped_no_session: AtomicU64,
}

impl SessionEventRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Swap the active session on cycle rotation.
    pub fn set_session(&self, session: Option<Arc<Session>>) {
        let slug = session.as_ref().map(|s| s.market().slug.clone());
        *self.current.write() = session;
        debug!(slug = slug.as_deref().unwrap_or("<none>"), "router_session_set");
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.read().clone()
    }

    pub fn handle_order_update(&self, order: Order) {
        match self.current.read().as_ref() {
            Some(session) => {
                self.forwarded_orders.fetch_add(1, Ordering::Relaxed);
                session.handle_order_event(order);
            }
            None => {
                self.dropped_no_session.fetch_add(1, Ordering::Relaxed);
                trace!(order_id = %order.order_id, "router_no_session");
            }
        }
    }

    pub fn handle_trade_update(&self, trade: TradeUpdate) {
        match self.current.read().as_ref() {
            Some(session) => {
                self.forwarded_trades.fetch_add(1, Ordering::Relaxed);
                session.handle_trade_event(trade);
            }
            None => {
                self.dropped_no_session.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// One-time registration on the trading service.
    pub fn register_with(self: &Arc<Self>, trading: &dyn TradingService) {
        let router = self.clone();
        trading.on_order_update(Arc::new(move |order: &Order| {
            router.handle_order_update(order.clone());
        }));
        let router = self.clone();
        trading.on_trade_update(Arc::new(move |trade: &TradeUpdate| {
            router.handle_trade_update(trade.clone());
        }));
    }

    /// Per-connection registration on a live user stream; buffered events
    /// flush through on first call.
    pub fn register_with_user_stream(self: &Arc<Self>, uds: &UserDataStream) {
        let router = self.clone();
        uds.on_order_update(Arc::new(move |order: &Order| {
            router.handle_order_update(order.clone());
        }));
        let router = self.clone();
        uds.on_trade_update(Arc::new(move |trade: &TradeUpdate| {
            router.handle_trade_update(trade.clone());
        }));
    }
}
