//! Authenticated user-channel WebSocket: order and trade confirmations for
//! the wallet.
//!
//! Unlike the price stream, events here are not droppable: anything that
//! arrives before the first handler registration is buffered and flushed in
//! arrival order the moment `on_order_update` / `on_trade_update` is first
//! called. Reconnects back off `5s x attempt`, giving up after
//! `max_reconnects` consecutive failures.

use crossbeam::queue::SegQueue;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::market::handler_list::{Handler, HandlerList};
use crate::market::stream::ConnState;
use crate::models::{
    now_ms, parse_price_cents, parse_size, Order, OrderStatus, OrderType, Side, TradeUpdate,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone)]
pub struct ApiCredentials {
    pub apikey: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("apikey", &self.apikey)
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UserStreamConfig {
    pub url: String,
    pub reconnect_base: Duration,
    pub max_reconnects: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for UserStreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            reconnect_base: Duration::from_secs(5),
            max_reconnects: 10,
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl UserStreamConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("USER_WS_URL") {
            config.url = v;
        }
        if let Ok(v) = std::env::var("USER_WS_RECONNECT_BASE_SECS") {
            if let Ok(secs) = v.parse() {
                config.reconnect_base = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("USER_WS_MAX_RECONNECTS") {
            config.max_reconnects = v.parse().unwrap_or(config.max_reconnects);
        }
        config
    }
}

// ============================================================================
// Wire structs and mapping
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireOrderMsg {
    id: String,
    #[serde(rename = "type", default)]
    msg_type: String,
    #[serde(default)]
    market: String,
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    original_size: String,
    #[serde(default)]
    size_matched: String,
    #[serde(default)]
    order_type: String,
}

#[derive(Debug, Deserialize)]
struct WireTradeMsg {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    taker_order_id: String,
    #[serde(default)]
    market: String,
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    size: String,
}

fn parse_side(s: &str) -> Option<Side> {
    match s.to_ascii_uppercase().as_str() {
        "BUY" => Some(Side::Buy),
        "SELL" => Some(Side::Sell),
        _ => None,
    }
}

/// `PLACEMENT -> Open`; `UPDATE -> Open` (or `Filled` once fully matched);
/// `CANCELLATION -> Canceled`.
pub fn map_order_message(value: &serde_json::Value) -> Option<Order> {
    let msg: WireOrderMsg = serde_json::from_value(value.clone()).ok()?;
    let side = parse_side(&msg.side)?;
    let price_cents = parse_price_cents(&msg.price)?;
    let size = parse_size(&msg.original_size)?;
    let filled = parse_size(&msg.size_matched).unwrap_or(0.0);

    let status = match msg.msg_type.to_ascii_uppercase().as_str() {
        "PLACEMENT" => OrderStatus::Open,
        "UPDATE" => {
            if filled + 1e-9 >= size && size > 0.0 {
                OrderStatus::Filled
            } else {
                OrderStatus::Open
            }
        }
        "CANCELLATION" => OrderStatus::Canceled,
        _ => return None,
    };

    let order_type = match msg.order_type.to_ascii_uppercase().as_str() {
        "FAK" | "FOK" | "IOC" => OrderType::Fak,
        _ => OrderType::Gtc,
    };

    let mut order = Order::request(msg.market, msg.asset_id, None, side, price_cents, size, order_type);
    order.order_id = msg.id;
    order.filled_size = filled;
    order.status = status;
    if filled > 0.0 {
        order.filled_price_cents = Some(price_cents);
    }
    if status == OrderStatus::Filled {
        order.filled_at_ms = Some(now_ms());
    }
    Some(order)
}

/// Only MATCHED trades are surfaced; anything below may still be retracted.
pub fn map_trade_message(value: &serde_json::Value) -> Option<TradeUpdate> {
    let msg: WireTradeMsg = serde_json::from_value(value.clone()).ok()?;
    if !msg.status.eq_ignore_ascii_case("MATCHED") {
        return None;
    }
    Some(TradeUpdate {
        trade_id: msg.id,
        order_id: msg.taker_order_id,
        market_slug: msg.market,
        asset_id: msg.asset_id,
        side: parse_side(&msg.side)?,
        price_cents: parse_price_cents(&msg.price)?,
        size: parse_size(&msg.size)?,
        timestamp_ms: now_ms(),
    })
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct UserStreamMetrics {
    pub frames: AtomicU64,
    pub orders: AtomicU64,
    pub trades: AtomicU64,
    pub buffered: AtomicU64,
    pub flushed: AtomicU64,
    pub skipped_unmatched: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

impl UserStreamMetrics {
    pub fn summary(&self) -> String {
        format!(
            "frames={} orders={} trades={} buffered={} flushed={} skipped_unmatched={} parse_errors={} reconnects={}",
            self.frames.load(Ordering::Relaxed),
            self.orders.load(Ordering::Relaxed),
            self.trades.load(Ordering::Relaxed),
            self.buffered.load(Ordering::Relaxed),
            self.flushed.load(Ordering::Relaxed),
            self.skipped_unmatched.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// UserDataStream
// ============================================================================

pub struct UserDataStream {
    config: UserStreamConfig,
    credentials: ApiCredentials,
    order_handlers: HandlerList<Order>,
    trade_handlers: HandlerList<TradeUpdate>,
    pending_orders: SegQueue<Order>,
    pending_trades: SegQueue<TradeUpdate>,
    orders_registered: AtomicBool,
    trades_registered: AtomicBool,
    state: RwLock<ConnState>,
    close_tx: watch::Sender<bool>,
    last_activity_ms: AtomicI64,
    metrics: UserStreamMetrics,
}

impl UserDataStream {
    pub fn new(config: UserStreamConfig, credentials: ApiCredentials) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            credentials,
            order_handlers: HandlerList::new(),
            trade_handlers: HandlerList::new(),
            pending_orders: SegQueue::new(),
            pending_trades: SegQueue::new(),
            orders_registered: AtomicBool::new(false),
            trades_registered: AtomicBool::new(false),
            state: RwLock::new(ConnState::Idle),
            close_tx,
            last_activity_ms: AtomicI64::new(0),
            metrics: UserStreamMetrics::default(),
        })
    }

    pub fn spawn(self: &Arc<Self>) {
        let stream = self.clone();
        tokio::spawn(async move {
            stream.run().await;
        });
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn metrics(&self) -> &UserStreamMetrics {
        &self.metrics
    }

    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Register an order handler. The first registration flushes everything
    /// buffered so far, in arrival order.
    pub fn on_order_update(&self, handler: Handler<Order>) {
        self.order_handlers.add(handler);
        if !self.orders_registered.swap(true, Ordering::SeqCst) {
            while let Some(order) = self.pending_orders.pop() {
                self.metrics.flushed.fetch_add(1, Ordering::Relaxed);
                self.order_handlers.emit(&order);
            }
        }
    }

    pub fn on_trade_update(&self, handler: Handler<TradeUpdate>) {
        self.trade_handlers.add(handler);
        if !self.trades_registered.swap(true, Ordering::SeqCst) {
            while let Some(trade) = self.pending_trades.pop() {
                self.metrics.flushed.fetch_add(1, Ordering::Relaxed);
                self.trade_handlers.emit(&trade);
            }
        }
    }

    pub fn clear_handlers(&self) {
        self.order_handlers.clear();
        self.trade_handlers.clear();
    }

    fn publish_order(&self, order: Order) {
        self.metrics.orders.fetch_add(1, Ordering::Relaxed);
        if self.orders_registered.load(Ordering::SeqCst) {
            self.order_handlers.emit(&order);
        } else {
            self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
            self.pending_orders.push(order);
        }
    }

    fn publish_trade(&self, trade: TradeUpdate) {
        self.metrics.trades.fetch_add(1, Ordering::Relaxed);
        if self.trades_registered.load(Ordering::SeqCst) {
            self.trade_handlers.emit(&trade);
        } else {
            self.metrics.buffered.fetch_add(1, Ordering::Relaxed);
            self.pending_trades.push(trade);
        }
    }

    // ------------------------------------------------------------------
    // Frame processing (socket-free; tests drive this directly)
    // ------------------------------------------------------------------

    pub fn process_text_frame(&self, text: &str) -> Option<String> {
        self.metrics.frames.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);

        if text.eq_ignore_ascii_case("PING") {
            return Some("PONG".to_string());
        }
        if text.eq_ignore_ascii_case("PONG") {
            return None;
        }

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "user_ws_bad_json");
                return None;
            }
        };
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    self.handle_event(&item);
                }
            }
            other => self.handle_event(&other),
        }
        None
    }

    fn handle_event(&self, value: &serde_json::Value) {
        let event_type = value
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        match event_type {
            "order" => match map_order_message(value) {
                Some(order) => self.publish_order(order),
                None => {
                    self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("user_ws_unmapped_order");
                }
            },
            "trade" => match map_trade_message(value) {
                Some(trade) => self.publish_trade(trade),
                None => {
                    // Usually a below-MATCHED status, not a parse failure.
                    self.metrics
                        .skipped_unmatched
                        .fetch_add(1, Ordering::Relaxed);
                    trace!("user_ws_trade_skipped");
                }
            },
            other => trace!(event_type = other, "user_ws_ignored_event"),
        }
    }

    fn auth_payload(&self) -> String {
        serde_json::json!({
            "type": "user",
            "auth": {
                "apikey": self.credentials.apikey,
                "secret": self.credentials.secret,
                "passphrase": self.credentials.passphrase,
            }
        })
        .to_string()
    }

    fn set_state(&self, next: ConnState, reason: &str) {
        let prev = {
            let mut state = self.state.write();
            let prev = *state;
            *state = next;
            prev
        };
        if prev != next {
            info!(from = %prev, to = %next, reason, "user_stream_transition");
        }
    }

    // ------------------------------------------------------------------
    // Connection loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *close_rx.borrow() {
                break;
            }
            if attempt >= self.config.max_reconnects {
                error!(
                    attempts = attempt,
                    "user_ws_giving_up: reconnect budget exhausted"
                );
                break;
            }
            if attempt > 0 {
                let delay = self.config.reconnect_base * attempt;
                self.set_state(ConnState::CoolDown, "backoff");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = close_rx.changed() => break,
                }
            }
            attempt += 1;

            self.set_state(ConnState::Dialing, "dial");
            let ws = match timeout(
                self.config.handshake_timeout,
                connect_async(&self.config.url),
            )
            .await
            {
                Ok(Ok((ws, resp))) => {
                    info!(status = %resp.status(), "user_ws_connected");
                    ws
                }
                Ok(Err(e)) => {
                    warn!(error = %e, attempt, "user_ws_dial_failed");
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(_) => {
                    warn!(attempt, "user_ws_handshake_timeout");
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            self.set_state(ConnState::Connected, "handshake_ok");
            let clean_session = self.read_loop(ws, &mut close_rx).await;
            if *close_rx.borrow() {
                break;
            }
            if clean_session {
                attempt = 0;
            }
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.set_state(ConnState::Closed, "closed");
        info!(metrics = %self.metrics.summary(), "user_stream_exit");
    }

    /// Returns true when the session streamed long enough to count as
    /// healthy (resets the backoff ladder).
    async fn read_loop(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        close_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let (mut write, mut read) = ws.split();

        if write
            .send(Message::Text(self.auth_payload()))
            .await
            .is_err()
        {
            warn!("user_ws_auth_send_failed");
            return false;
        }
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
        self.set_state(ConnState::Reading, "authenticated");
        let started = std::time::Instant::now();

        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = close_rx.changed() => return true,
                _ = ping.tick() => {
                    let silent_ms = now_ms() - self.last_activity_ms.load(Ordering::Relaxed);
                    if silent_ms > self.config.pong_timeout.as_millis() as i64 {
                        warn!("user_ws_pong_timeout");
                        break;
                    }
                    if write.send(Message::Text("PING".to_string())).await.is_err() {
                        break;
                    }
                }
                frame = timeout(self.config.read_timeout, read.next()) => {
                    match frame {
                        Err(_) => { warn!("user_ws_read_timeout"); break; }
                        Ok(None) => { warn!("user_ws_stream_ended"); break; }
                        Ok(Some(Err(e))) => { warn!(error = %e, "user_ws_read_error"); break; }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(reply) = self.process_text_frame(&text) {
                                if write.send(Message::Text(reply)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Ok(Message::Close(_)))) => { debug!("user_ws_server_close"); break; }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
        started.elapsed() > Duration::from_secs(30)
    }
}
