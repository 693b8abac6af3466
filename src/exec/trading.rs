//! Order-IO boundary.
//!
//! `TradingService` is the fixed contract the core consumes; the real
//! exchange client (REST + signing) lives outside this crate. The paper
//! implementation fills against the live top-of-book cell, which is enough
//! to run the full engine without credentials and to drive the end-to-end
//! scenarios.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market::best_book::AtomicBestBook;
use crate::market::handler_list::{Handler, HandlerList};
use crate::market::quality::{self, MarketQuality, QualityConfig};
use crate::models::{
    now_ms, Market, Order, OrderStatus, OrderType, Side, TokenKind, TradeUpdate,
};

/// Stable prefix of every rejection while paused. Dashboards and tests key
/// off this string.
pub const PAUSED_REASON_PREFIX: &str = "trading paused";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSource {
    Ws,
    Rest,
}

/// Four-way top of book as the execution layer sees it.
#[derive(Debug, Clone, Copy)]
pub struct TopOfBook {
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub no_bid: i64,
    pub no_ask: i64,
    pub yes_ask_size: f64,
    pub no_ask_size: f64,
    pub source: QuoteSource,
}

impl TopOfBook {
    pub fn ask(&self, token: TokenKind) -> i64 {
        match token {
            TokenKind::Up => self.yes_ask,
            TokenKind::Down => self.no_ask,
        }
    }

    pub fn bid(&self, token: TokenKind) -> i64 {
        match token {
            TokenKind::Up => self.yes_bid,
            TokenKind::Down => self.no_bid,
        }
    }

    pub fn ask_size(&self, token: TokenKind) -> f64 {
        match token {
            TokenKind::Up => self.yes_ask_size,
            TokenKind::Down => self.no_ask_size,
        }
    }
}

/// Open inventory in one asset.
#[derive(Debug, Clone)]
pub struct Position {
    pub market_slug: String,
    pub asset_id: String,
    pub token: Option<TokenKind>,
    pub size: f64,
    pub avg_price_cents: f64,
}

/// Fixed contract between the core and the exchange-facing layer.
#[async_trait]
pub trait TradingService: Send + Sync {
    async fn place_order(&self, order: Order) -> Result<Order>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
    /// Empty slug cancels everything.
    async fn cancel_orders_for_market(&self, slug: &str) -> Result<usize>;
    async fn cancel_orders_not_in_market(&self, slug: &str) -> Result<usize>;
    async fn get_order(&self, order_id: &str) -> Result<Option<Order>>;
    async fn get_active_orders(&self) -> Result<Vec<Order>>;
    async fn get_open_positions_for_market(&self, slug: &str) -> Result<Vec<Position>>;
    async fn get_top_of_book(&self, market: &Market) -> Result<TopOfBook>;
    async fn get_market_quality(&self, market: &Market, cfg: &QualityConfig)
        -> Result<MarketQuality>;

    fn pause_trading(&self, reason: &str);
    fn resume_trading(&self);
    /// The pause reason while risk-off, None otherwise.
    fn paused_reason(&self) -> Option<String>;
    fn set_current_market_info(&self, market: Arc<Market>);

    /// Registration point for the session event router. Called once per
    /// process.
    fn on_order_update(&self, handler: Handler<Order>);
    fn on_trade_update(&self, handler: Handler<TradeUpdate>);
}

// ============================================================================
// Paper implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct PaperMetrics {
    pub orders_placed: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub orders_canceled: AtomicU64,
    pub fills: AtomicU64,
    pub pause_rejects: AtomicU64,
}

impl PaperMetrics {
    pub fn summary(&self) -> String {
        format!(
            "placed={} rejected={} canceled={} fills={} pause_rejects={}",
            self.orders_placed.load(Ordering::Relaxed),
            self.orders_rejected.load(Ordering::Relaxed),
            self.orders_canceled.load(Ordering::Relaxed),
            self.fills.load(Ordering::Relaxed),
            self.pause_rejects.load(Ordering::Relaxed),
        )
    }
}

/// Simulated exchange keyed off the shared `AtomicBestBook`. FAK orders
/// match immediately against the top of book; GTC orders rest until a
/// `crank()` observes a crossing price.
pub struct PaperTradingService {
    book: Arc<AtomicBestBook>,
    current_market: RwLock<Option<Arc<Market>>>,
    orders: Mutex<HashMap<String, Order>>,
    positions: Mutex<HashMap<String, Position>>,
    paused: Mutex<Option<String>>,
    order_handlers: HandlerList<Order>,
    trade_handlers: HandlerList<TradeUpdate>,
    metrics: PaperMetrics,
}

impl PaperTradingService {
    pub fn new(book: Arc<AtomicBestBook>) -> Arc<Self> {
        Arc::new(Self {
            book,
            current_market: RwLock::new(None),
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            paused: Mutex::new(None),
            order_handlers: HandlerList::new(),
            trade_handlers: HandlerList::new(),
            metrics: PaperMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &PaperMetrics {
        &self.metrics
    }

    /// Periodically match resting GTC orders against the book. The binary
    /// runs this on a small interval task.
    pub fn spawn_crank(self: &Arc<Self>, every: std::time::Duration) {
        let svc = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                svc.crank();
            }
        });
    }

    /// Match resting GTC orders whose limit is crossed by the current book.
    /// Fills are at the order's own limit (maker assumption).
    pub fn crank(&self) {
        let snapshot = self.book.load();
        let mut fills: Vec<Order> = Vec::new();
        {
            let mut orders = self.orders.lock();
            for order in orders.values_mut() {
                if order.order_type != OrderType::Gtc || !order.status.is_live() {
                    continue;
                }
                let Some(token) = order.token else { continue };
                let crossed = match order.side {
                    Side::Buy => {
                        let ask = snapshot.ask(token);
                        ask > 0 && ask <= order.price_cents
                    }
                    Side::Sell => {
                        let bid = snapshot.bid(token);
                        bid > 0 && bid >= order.price_cents
                    }
                };
                if crossed {
                    order.filled_size = order.size;
                    order.filled_price_cents = Some(order.price_cents);
                    order.status = OrderStatus::Filled;
                    order.filled_at_ms = Some(now_ms());
                    fills.push(order.clone());
                }
            }
        }
        for order in fills {
            self.settle_fill(&order);
        }
    }

    /// Force-fill a live order (tests drive partial scenarios through this).
    pub fn simulate_fill(&self, order_id: &str, size: f64, price_cents: i64) -> Result<Order> {
        let updated = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else {
                bail!("unknown order {order_id}");
            };
            if order.status.is_terminal() {
                bail!("order {order_id} already {}", order.status);
            }
            order.filled_size = (order.filled_size + size).min(order.size);
            order.filled_price_cents = Some(price_cents);
            if order.filled_size + 1e-9 >= order.size {
                order.status = OrderStatus::Filled;
                order.filled_at_ms = Some(now_ms());
            } else {
                order.status = OrderStatus::Partial;
            }
            order.clone()
        };
        self.settle_fill(&updated);
        Ok(updated)
    }

    fn settle_fill(&self, order: &Order) {
        self.metrics.fills.fetch_add(1, Ordering::Relaxed);
        self.apply_position(order);
        self.order_handlers.emit(order);
        let trade = TradeUpdate {
            trade_id: Uuid::new_v4().to_string(),
            order_id: order.order_id.clone(),
            market_slug: order.market_slug.clone(),
            asset_id: order.asset_id.clone(),
            side: order.side,
            price_cents: order.filled_price_cents.unwrap_or(order.price_cents),
            size: order.filled_size,
            timestamp_ms: now_ms(),
        };
        self.trade_handlers.emit(&trade);
    }

    fn apply_position(&self, order: &Order) {
        let mut positions = self.positions.lock();
        let pos = positions
            .entry(order.asset_id.clone())
            .or_insert_with(|| Position {
                market_slug: order.market_slug.clone(),
                asset_id: order.asset_id.clone(),
                token: order.token,
                size: 0.0,
                avg_price_cents: 0.0,
            });
        let fill_price = order.filled_price_cents.unwrap_or(order.price_cents) as f64;
        match order.side {
            Side::Buy => {
                let total_cost = pos.avg_price_cents * pos.size + fill_price * order.filled_size;
                pos.size += order.filled_size;
                if pos.size > 0.0 {
                    pos.avg_price_cents = total_cost / pos.size;
                }
            }
            Side::Sell => {
                pos.size = (pos.size - order.filled_size).max(0.0);
            }
        }
    }

    fn token_for(&self, order: &Order) -> Option<TokenKind> {
        order.token.or_else(|| {
            self.current_market
                .read()
                .as_ref()
                .and_then(|m| m.token_for_asset(&order.asset_id))
        })
    }
}

#[async_trait]
impl TradingService for PaperTradingService {
    async fn place_order(&self, mut order: Order) -> Result<Order> {
        if let Some(reason) = self.paused.lock().clone() {
            if !order.bypass_risk_off {
                self.metrics.pause_rejects.fetch_add(1, Ordering::Relaxed);
                bail!("{PAUSED_REASON_PREFIX}: {reason}");
            }
        }
        if order.size <= 0.0 || order.price_cents <= 0 || order.price_cents >= 100 {
            self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed);
            bail!(
                "invalid order: size={} price={}c",
                order.size,
                order.price_cents
            );
        }

        order.order_id = Uuid::new_v4().to_string();
        order.status = OrderStatus::Open;
        order.token = self.token_for(&order);
        self.metrics.orders_placed.fetch_add(1, Ordering::Relaxed);

        self.orders
            .lock()
            .insert(order.order_id.clone(), order.clone());
        // PLACEMENT ack.
        self.order_handlers.emit(&order);

        if order.order_type == OrderType::Fak {
            let snapshot = self.book.load();
            let filled = match (order.token, order.side) {
                (Some(token), Side::Buy) => {
                    let ask = snapshot.ask(token);
                    if ask > 0 && ask <= order.price_cents {
                        let avail = snapshot.ask_size(token);
                        let qty = if avail > 0.0 {
                            avail.min(order.size)
                        } else {
                            order.size
                        };
                        Some((qty, ask))
                    } else {
                        None
                    }
                }
                (Some(token), Side::Sell) => {
                    let bid = snapshot.bid(token);
                    if bid > 0 && bid >= order.price_cents {
                        let avail = snapshot.bid_size(token);
                        let qty = if avail > 0.0 {
                            avail.min(order.size)
                        } else {
                            order.size
                        };
                        Some((qty, bid))
                    } else {
                        None
                    }
                }
                (None, _) => None,
            };

            let updated = {
                let mut orders = self.orders.lock();
                let stored = orders.get_mut(&order.order_id).expect("just inserted");
                match filled {
                    Some((qty, px)) => {
                        stored.filled_size = qty;
                        stored.filled_price_cents = Some(px);
                        if qty + 1e-9 >= stored.size {
                            stored.status = OrderStatus::Filled;
                        } else {
                            // Remainder is killed.
                            stored.status = OrderStatus::Canceled;
                        }
                        stored.filled_at_ms = Some(now_ms());
                    }
                    None => {
                        stored.status = OrderStatus::Canceled;
                    }
                }
                stored.clone()
            };
            if updated.filled_size > 0.0 {
                self.settle_fill(&updated);
            } else {
                debug!(order_id = %updated.order_id, "paper_fak_miss");
                self.order_handlers.emit(&updated);
            }
            return Ok(updated);
        }

        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let canceled = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else {
                bail!("unknown order {order_id}");
            };
            if order.status.is_terminal() {
                // Idempotent: canceling a done order is a no-op.
                None
            } else {
                order.status = OrderStatus::Canceled;
                Some(order.clone())
            }
        };
        if let Some(order) = canceled {
            self.metrics.orders_canceled.fetch_add(1, Ordering::Relaxed);
            self.order_handlers.emit(&order);
        }
        Ok(())
    }

    async fn cancel_orders_for_market(&self, slug: &str) -> Result<usize> {
        let canceled: Vec<Order> = {
            let mut orders = self.orders.lock();
            orders
                .values_mut()
                .filter(|o| o.status.is_live() && (slug.is_empty() || o.market_slug == slug))
                .map(|o| {
                    o.status = OrderStatus::Canceled;
                    o.clone()
                })
                .collect()
        };
        for order in &canceled {
            self.metrics.orders_canceled.fetch_add(1, Ordering::Relaxed);
            self.order_handlers.emit(order);
        }
        Ok(canceled.len())
    }

    async fn cancel_orders_not_in_market(&self, slug: &str) -> Result<usize> {
        let canceled: Vec<Order> = {
            let mut orders = self.orders.lock();
            orders
                .values_mut()
                .filter(|o| o.status.is_live() && o.market_slug != slug)
                .map(|o| {
                    o.status = OrderStatus::Canceled;
                    o.clone()
                })
                .collect()
        };
        for order in &canceled {
            self.metrics.orders_canceled.fetch_add(1, Ordering::Relaxed);
            self.order_handlers.emit(order);
        }
        Ok(canceled.len())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.orders.lock().get(order_id).cloned())
    }

    async fn get_active_orders(&self) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|o| o.status.is_live())
            .cloned()
            .collect())
    }

    async fn get_open_positions_for_market(&self, slug: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .values()
            .filter(|p| p.size > 0.0 && (slug.is_empty() || p.market_slug == slug))
            .cloned()
            .collect())
    }

    async fn get_top_of_book(&self, _market: &Market) -> Result<TopOfBook> {
        let snapshot = self.book.load();
        Ok(TopOfBook {
            yes_bid: snapshot.yes_bid,
            yes_ask: snapshot.yes_ask,
            no_bid: snapshot.no_bid,
            no_ask: snapshot.no_ask,
            yes_ask_size: snapshot.yes_ask_size,
            no_ask_size: snapshot.no_ask_size,
            source: QuoteSource::Ws,
        })
    }

    async fn get_market_quality(
        &self,
        _market: &Market,
        cfg: &QualityConfig,
    ) -> Result<MarketQuality> {
        let snapshot = self.book.load();
        Ok(quality::evaluate(&snapshot, now_ms(), cfg, false))
    }

    fn pause_trading(&self, reason: &str) {
        let mut paused = self.paused.lock();
        if paused.is_none() {
            warn!(reason, "trading_paused");
        }
        *paused = Some(reason.to_string());
    }

    fn resume_trading(&self) {
        let was = self.paused.lock().take();
        if was.is_some() {
            info!("trading_resumed");
        }
    }

    fn paused_reason(&self) -> Option<String> {
        self.paused.lock().clone()
    }

    fn set_current_market_info(&self, market: Arc<Market>) {
        *self.current_market.write() = Some(market);
    }

    fn on_order_update(&self, handler: Handler<Order>) {
        self.order_handlers.add(handler);
    }

    fn on_trade_update(&self, handler: Handler<TradeUpdate>) {
        self.trade_handlers.add(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scale_size;

    fn setup() -> (Arc<AtomicBestBook>, Arc<PaperTradingService>, Arc<Market>) {
        let book = Arc::new(AtomicBestBook::new());
        book.update_token(TokenKind::Up, 48, 52, scale_size(50.0), scale_size(50.0));
        book.update_token(TokenKind::Down, 46, 49, scale_size(50.0), scale_size(50.0));
        let svc = PaperTradingService::new(book.clone());
        let market = Arc::new(Market::new(
            "btc-updown-15m-1766394900",
            "0xcond",
            "yes-asset",
            "no-asset",
        ));
        svc.set_current_market_info(market.clone());
        (book, svc, market)
    }

    fn buy(market: &Market, token: TokenKind, price: i64, size: f64, t: OrderType) -> Order {
        Order::request(
            market.slug.clone(),
            market.asset_id(token).to_string(),
            Some(token),
            Side::Buy,
            price,
            size,
            t,
        )
    }

    #[tokio::test]
    async fn test_fak_fills_at_ask() {
        let (_book, svc, market) = setup();
        let placed = svc
            .place_order(buy(&market, TokenKind::Up, 53, 2.0, OrderType::Fak))
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Filled);
        assert_eq!(placed.filled_price_cents, Some(52));
        assert!((placed.filled_size - 2.0).abs() < 1e-9);

        let pos = svc.get_open_positions_for_market(&market.slug).await.unwrap();
        assert_eq!(pos.len(), 1);
        assert!((pos[0].size - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fak_misses_above_limit() {
        let (_book, svc, market) = setup();
        let placed = svc
            .place_order(buy(&market, TokenKind::Up, 50, 2.0, OrderType::Fak))
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Canceled);
        assert_eq!(placed.filled_size, 0.0);
    }

    #[tokio::test]
    async fn test_gtc_rests_then_cranks() {
        let (book, svc, market) = setup();
        let placed = svc
            .place_order(buy(&market, TokenKind::Down, 44, 3.0, OrderType::Gtc))
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Open);

        svc.crank();
        assert_eq!(
            svc.get_order(&placed.order_id).await.unwrap().unwrap().status,
            OrderStatus::Open
        );

        // Ask drops through the limit: maker fill at the order's own price.
        book.update_token(TokenKind::Down, 42, 43, 0, 0);
        svc.crank();
        let done = svc.get_order(&placed.order_id).await.unwrap().unwrap();
        assert_eq!(done.status, OrderStatus::Filled);
        assert_eq!(done.filled_price_cents, Some(44));
    }

    #[tokio::test]
    async fn test_pause_rejects_with_stable_reason() {
        let (_book, svc, market) = setup();
        svc.pause_trading("metadata fetch failed");
        let err = svc
            .place_order(buy(&market, TokenKind::Up, 53, 1.0, OrderType::Fak))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with(PAUSED_REASON_PREFIX));

        // Hedge-style orders bypass risk-off.
        let hedge = buy(&market, TokenKind::Down, 50, 1.0, OrderType::Gtc).bypassing_risk_off();
        assert!(svc.place_order(hedge).await.is_ok());

        svc.resume_trading();
        assert!(svc.paused_reason().is_none());
        assert!(svc
            .place_order(buy(&market, TokenKind::Up, 53, 1.0, OrderType::Fak))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancel_idempotent_and_bulk() {
        let (_book, svc, market) = setup();
        let a = svc
            .place_order(buy(&market, TokenKind::Down, 40, 1.0, OrderType::Gtc))
            .await
            .unwrap();
        let b = svc
            .place_order(buy(&market, TokenKind::Down, 41, 1.0, OrderType::Gtc))
            .await
            .unwrap();

        svc.cancel_order(&a.order_id).await.unwrap();
        // Second cancel of the same order is a no-op, not an error.
        svc.cancel_order(&a.order_id).await.unwrap();
        assert!(svc.cancel_order("nope").await.is_err());

        let n = svc.cancel_orders_for_market("").await.unwrap();
        assert_eq!(n, 1); // only b was still live
        assert_eq!(
            svc.get_order(&b.order_id).await.unwrap().unwrap().status,
            OrderStatus::Canceled
        );
        assert!(svc.get_active_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_updates_reach_handlers() {
        let (_book, svc, market) = setup();
        let seen: Arc<Mutex<Vec<OrderStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        svc.on_order_update(Arc::new(move |o: &Order| sink.lock().push(o.status)));

        svc.place_order(buy(&market, TokenKind::Up, 53, 1.0, OrderType::Fak))
            .await
            .unwrap();
        let statuses = seen.lock().clone();
        assert_eq!(statuses, vec![OrderStatus::Open, OrderStatus::Filled]);
    }
}
