//! Market-channel WebSocket subscriber.
//!
//! One persistent connection per session:
//! - subscribe with `{"type":"market","assets_ids":[yes,no]}`
//! - decode `book` / `price_change` frames (single objects or arrays)
//! - answer bare `PING` text with `PONG`, watchdog on prolonged silence
//! - always feed the `AtomicBestBook`, emit `PriceChangedEvent`s only past
//!   the market-quality gate (both sides present, spread within bounds)
//! - coalesced reconnect requests with a fixed cooldown before every dial
//!
//! Cycle rotation can replace the subscribed asset pair without dropping
//! the socket: `prepare_switch` swaps the market pointer and resets the
//! book in place, `resubscribe` announces the new pair.

use arc_swap::ArcSwap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::market::best_book::AtomicBestBook;
use crate::market::handler_list::{Handler, HandlerList};
use crate::models::{
    now_ms, parse_price_cents, parse_size, scale_size, Market, PriceChangedEvent,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Quality gate: emit only when |ask - bid| stays within this.
    pub max_spread_cents: i64,
    pub ping_interval: Duration,
    /// Reconnect when nothing (pong or data) arrived for this long.
    pub pong_timeout: Duration,
    /// Read deadline, re-armed every loop iteration.
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Fixed cooldown before every dial attempt.
    pub reconnect_cooldown: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            max_spread_cents: 10,
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            reconnect_cooldown: Duration::from_secs(15),
        }
    }
}

impl StreamConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("MARKET_WS_URL") {
            config.url = v;
        }
        if let Ok(v) = std::env::var("MARKET_WS_MAX_SPREAD_CENTS") {
            config.max_spread_cents = v.parse().unwrap_or(config.max_spread_cents);
        }
        if let Ok(v) = std::env::var("MARKET_WS_PONG_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.pong_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("MARKET_WS_RECONNECT_COOLDOWN_SECS") {
            if let Ok(secs) = v.parse() {
                config.reconnect_cooldown = Duration::from_secs(secs);
            }
        }
        config
    }
}

// ============================================================================
// Connection state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Dialing,
    Connected,
    Reading,
    CoolDown,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Idle => "IDLE",
            ConnState::Dialing => "DIALING",
            ConnState::Connected => "CONNECTED",
            ConnState::Reading => "READING",
            ConnState::CoolDown => "COOLDOWN",
            ConnState::Reconnecting => "RECONNECTING",
            ConnState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExit {
    CloseSignal,
    ReadTimeout,
    StreamEnded,
    NetworkError,
    ServerClose,
    PongTimeout,
    WriteFailed,
    ReconnectRequested,
}

impl fmt::Display for ReadExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadExit::CloseSignal => "close_signal",
            ReadExit::ReadTimeout => "read_timeout",
            ReadExit::StreamEnded => "stream_ended",
            ReadExit::NetworkError => "network_error",
            ReadExit::ServerClose => "server_close",
            ReadExit::PongTimeout => "pong_timeout",
            ReadExit::WriteFailed => "write_failed",
            ReadExit::ReconnectRequested => "reconnect_requested",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub frames: AtomicU64,
    pub books: AtomicU64,
    pub price_changes: AtomicU64,
    pub events_emitted: AtomicU64,
    pub dropped_quality: AtomicU64,
    pub dropped_no_handlers: AtomicU64,
    pub dropped_closed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub resubscribes: AtomicU64,
    pub pings_sent: AtomicU64,
    pub pongs_received: AtomicU64,
}

impl StreamMetrics {
    pub fn summary(&self) -> String {
        format!(
            "frames={} books={} price_changes={} emitted={} dropped_quality={} dropped_no_handlers={} parse_errors={} reconnects={} resubscribes={}",
            self.frames.load(Ordering::Relaxed),
            self.books.load(Ordering::Relaxed),
            self.price_changes.load(Ordering::Relaxed),
            self.events_emitted.load(Ordering::Relaxed),
            self.dropped_quality.load(Ordering::Relaxed),
            self.dropped_no_handlers.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.resubscribes.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// Wire structs
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct WireBook {
    asset_id: String,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    // Legacy field names carried by older feeds.
    #[serde(default)]
    buys: Vec<WireLevel>,
    #[serde(default)]
    sells: Vec<WireLevel>,
}

#[derive(Debug, Deserialize)]
struct WirePriceChange {
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
    #[serde(default)]
    price_changes: Vec<WirePriceChangeEntry>,
}

#[derive(Debug, Deserialize)]
struct WirePriceChangeEntry {
    asset_id: String,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
}

/// One parsed side: price cents plus resting size in shares.
#[derive(Debug, Clone, Copy)]
struct SideQuote {
    price_cents: i64,
    size: f64,
}

// ============================================================================
// MarketDataStream
// ============================================================================

pub struct MarketDataStream {
    config: StreamConfig,
    market: ArcSwap<Market>,
    book: Arc<AtomicBestBook>,
    handlers: HandlerList<PriceChangedEvent>,
    state: RwLock<ConnState>,
    close_tx: watch::Sender<bool>,
    /// Bumped on every resubscribe request; the socket task sends the
    /// subscription for whatever market is current at that moment.
    resub_tx: watch::Sender<u64>,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    last_activity_ms: AtomicI64,
    metrics: StreamMetrics,
}

impl MarketDataStream {
    pub fn new(config: StreamConfig, market: Arc<Market>, book: Arc<AtomicBestBook>) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        let (resub_tx, _) = watch::channel(0u64);
        // Capacity 1: reconnect requests coalesce.
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            market: ArcSwap::new(market),
            book,
            handlers: HandlerList::new(),
            state: RwLock::new(ConnState::Idle),
            close_tx,
            resub_tx,
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            last_activity_ms: AtomicI64::new(0),
            metrics: StreamMetrics::default(),
        })
    }

    /// Start the connection task. Tests drive `process_text_frame` directly
    /// and never call this.
    pub fn spawn(self: &Arc<Self>) {
        let stream = self.clone();
        tokio::spawn(async move {
            stream.run().await;
        });
    }

    pub fn book(&self) -> Arc<AtomicBestBook> {
        self.book.clone()
    }

    pub fn market(&self) -> Arc<Market> {
        self.market.load_full()
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    pub fn on_price_changed(&self, handler: Handler<PriceChangedEvent>) {
        self.handlers.add(handler);
    }

    pub fn handlers(&self) -> &HandlerList<PriceChangedEvent> {
        &self.handlers
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Swap the market pointer and clear the book *in place*. Must run
    /// before the new subscription is announced so no consumer reads a
    /// fresh-looking book from the previous cycle.
    pub fn prepare_switch(&self, new_market: Arc<Market>) {
        let old = self.market.swap(new_market.clone());
        self.book.reset();
        info!(
            old_slug = %old.slug,
            new_slug = %new_market.slug,
            "stream_market_switched"
        );
    }

    /// Ask the socket task to send the subscription for the current market.
    /// Errors when the stream is closed; the caller then falls back to a
    /// fresh connection.
    pub fn resubscribe(&self) -> anyhow::Result<()> {
        if self.is_closed() || self.state() == ConnState::Closed {
            anyhow::bail!("market stream is closed");
        }
        let next = *self.resub_tx.borrow() + 1;
        self.resub_tx.send_replace(next);
        Ok(())
    }

    /// Coalesced reconnect request (capacity-1 channel; extra signals drop).
    pub fn request_reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    fn set_state(&self, next: ConnState, reason: &str) {
        let prev = {
            let mut state = self.state.write();
            let prev = *state;
            *state = next;
            prev
        };
        if prev != next {
            info!(from = %prev, to = %next, reason, "stream_transition");
        }
    }

    #[inline]
    fn touch_activity(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Connection loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        let mut reconnect_rx = self
            .reconnect_rx
            .lock()
            .take()
            .expect("run called twice");
        let mut resub_rx = self.resub_tx.subscribe();
        resub_rx.borrow_and_update();

        loop {
            if *close_rx.borrow() {
                break;
            }
            self.set_state(ConnState::Dialing, "dial");
            let connected =
                timeout(self.config.handshake_timeout, connect_async(&self.config.url)).await;

            let ws = match connected {
                Ok(Ok((ws, resp))) => {
                    info!(status = %resp.status(), "market_ws_connected");
                    ws
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "market_ws_dial_failed");
                    if !self.cooldown(&mut close_rx).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!("market_ws_handshake_timeout");
                    if !self.cooldown(&mut close_rx).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnState::Connected, "handshake_ok");
            let exit = self
                .read_loop(ws, &mut close_rx, &mut reconnect_rx, &mut resub_rx)
                .await;

            if exit == ReadExit::CloseSignal {
                break;
            }
            warn!(reason = %exit, "market_ws_disconnected");
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            if !self.cooldown(&mut close_rx).await {
                break;
            }
        }
        self.set_state(ConnState::Closed, "closed");
        info!(metrics = %self.metrics.summary(), "market_stream_exit");
    }

    /// Fixed cooldown before the next dial; false when close fired.
    async fn cooldown(&self, close_rx: &mut watch::Receiver<bool>) -> bool {
        self.set_state(ConnState::CoolDown, "cooldown");
        tokio::select! {
            _ = sleep(self.config.reconnect_cooldown) => {
                self.set_state(ConnState::Reconnecting, "cooldown_elapsed");
                true
            }
            _ = close_rx.changed() => false,
        }
    }

    async fn read_loop(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        close_rx: &mut watch::Receiver<bool>,
        reconnect_rx: &mut mpsc::Receiver<()>,
        resub_rx: &mut watch::Receiver<u64>,
    ) -> ReadExit {
        let (mut write, mut read) = ws.split();

        if write
            .send(Message::Text(self.subscription_payload()))
            .await
            .is_err()
        {
            return ReadExit::WriteFailed;
        }
        self.touch_activity();
        self.set_state(ConnState::Reading, "subscribed");

        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = close_rx.changed() => return ReadExit::CloseSignal,
                Some(_) = reconnect_rx.recv() => return ReadExit::ReconnectRequested,
                changed = resub_rx.changed() => {
                    if changed.is_ok() {
                        self.metrics.resubscribes.fetch_add(1, Ordering::Relaxed);
                        if write
                            .send(Message::Text(self.subscription_payload()))
                            .await
                            .is_err()
                        {
                            return ReadExit::WriteFailed;
                        }
                        debug!(slug = %self.market().slug, "market_ws_resubscribed");
                    }
                }
                _ = ping.tick() => {
                    let silent_ms = now_ms() - self.last_activity_ms.load(Ordering::Relaxed);
                    if silent_ms > self.config.pong_timeout.as_millis() as i64 {
                        return ReadExit::PongTimeout;
                    }
                    if write.send(Message::Text("PING".to_string())).await.is_err() {
                        return ReadExit::WriteFailed;
                    }
                    self.metrics.pings_sent.fetch_add(1, Ordering::Relaxed);
                }
                frame = timeout(self.config.read_timeout, read.next()) => {
                    match frame {
                        Err(_) => return ReadExit::ReadTimeout,
                        Ok(None) => return ReadExit::StreamEnded,
                        Ok(Some(Err(e))) => {
                            warn!(error = %e, "market_ws_read_error");
                            return ReadExit::NetworkError;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(reply) = self.process_text_frame(&text) {
                                if write.send(Message::Text(reply)).await.is_err() {
                                    return ReadExit::WriteFailed;
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return ReadExit::WriteFailed;
                            }
                        }
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            debug!(?frame, "market_ws_close_frame");
                            return ReadExit::ServerClose;
                        }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
    }

    fn subscription_payload(&self) -> String {
        let market = self.market();
        serde_json::json!({
            "type": "market",
            "assets_ids": [market.yes_asset_id, market.no_asset_id],
        })
        .to_string()
    }

    // ------------------------------------------------------------------
    // Frame processing (socket-free; tests drive this directly)
    // ------------------------------------------------------------------

    /// Handle one text frame. Returns a reply to write back, if any.
    pub fn process_text_frame(&self, text: &str) -> Option<String> {
        self.metrics.frames.fetch_add(1, Ordering::Relaxed);
        self.touch_activity();

        if text.eq_ignore_ascii_case("PING") {
            return Some("PONG".to_string());
        }
        if text.eq_ignore_ascii_case("PONG") {
            self.metrics.pongs_received.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "market_ws_bad_json");
                return None;
            }
        };

        // Messages may arrive as a top-level array.
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    self.handle_event(item);
                }
            }
            other => self.handle_event(other),
        }
        None
    }

    fn handle_event(&self, value: serde_json::Value) {
        let event_type = value
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        match event_type {
            "book" => self.handle_book(value),
            "price_change" => self.handle_price_change(value),
            "subscribed" => debug!("market_ws_subscription_ack"),
            "last_trade_price" | "tick_size_change" => {
                trace!(event_type, "market_ws_ignored_event");
            }
            _ => {
                trace!(event_type, "market_ws_unknown_event");
            }
        }
    }

    fn handle_book(&self, value: serde_json::Value) {
        let msg: WireBook = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "market_ws_bad_book");
                return;
            }
        };
        self.metrics.books.fetch_add(1, Ordering::Relaxed);

        // Prefer the explicit scalars; fall back to the top of the arrays
        // (legacy feeds use buys/sells).
        let bids = if !msg.bids.is_empty() { &msg.bids } else { &msg.buys };
        let asks = if !msg.asks.is_empty() { &msg.asks } else { &msg.sells };

        let bid = msg
            .best_bid
            .as_deref()
            .and_then(|p| parse_price_cents(p).map(|c| SideQuote { price_cents: c, size: 0.0 }))
            .or_else(|| top_level(bids, true));
        let ask = msg
            .best_ask
            .as_deref()
            .and_then(|p| parse_price_cents(p).map(|c| SideQuote { price_cents: c, size: 0.0 }))
            .or_else(|| top_level(asks, false));

        self.apply_quote(&msg.asset_id, bid, ask);
    }

    fn handle_price_change(&self, value: serde_json::Value) {
        let msg: WirePriceChange = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "market_ws_bad_price_change");
                return;
            }
        };
        self.metrics.price_changes.fetch_add(1, Ordering::Relaxed);

        if let Some(asset_id) = msg.asset_id.as_deref() {
            let bid = msg
                .best_bid
                .as_deref()
                .and_then(parse_price_cents)
                .map(|c| SideQuote { price_cents: c, size: 0.0 });
            let ask = msg
                .best_ask
                .as_deref()
                .and_then(parse_price_cents)
                .map(|c| SideQuote { price_cents: c, size: 0.0 });
            self.apply_quote(asset_id, bid, ask);
        }
        for entry in &msg.price_changes {
            let bid = entry
                .best_bid
                .as_deref()
                .and_then(parse_price_cents)
                .map(|c| SideQuote { price_cents: c, size: 0.0 });
            let ask = entry
                .best_ask
                .as_deref()
                .and_then(parse_price_cents)
                .map(|c| SideQuote { price_cents: c, size: 0.0 });
            self.apply_quote(&entry.asset_id, bid, ask);
        }
    }

    /// Merge a parsed quote into the book and maybe publish. The snapshot
    /// is always updated (even single-sided); strategies only hear about
    /// quotes that pass the quality gate.
    fn apply_quote(&self, asset_id: &str, bid: Option<SideQuote>, ask: Option<SideQuote>) {
        if bid.is_none() && ask.is_none() {
            return;
        }
        let market = self.market();
        let Some(token) = market.token_for_asset(asset_id) else {
            // Stale subscription during rotation, or an asset we never asked
            // for. Either way it must not touch the current cycle's book.
            trace!(asset_id, "market_ws_foreign_asset");
            return;
        };

        self.book.update_token(
            token,
            bid.map(|q| q.price_cents).unwrap_or(0),
            ask.map(|q| q.price_cents).unwrap_or(0),
            bid.map(|q| scale_size(q.size)).unwrap_or(0),
            ask.map(|q| scale_size(q.size)).unwrap_or(0),
        );

        let (Some(bid), Some(ask)) = (bid, ask) else {
            return;
        };
        if (ask.price_cents - bid.price_cents).abs() > self.config.max_spread_cents {
            self.metrics.dropped_quality.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.is_closed() {
            self.metrics.dropped_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.handlers.is_empty() {
            // Price events are droppable: the snapshot already holds the
            // latest value for whoever registers later.
            self.metrics
                .dropped_no_handlers
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mid = (bid.price_cents + ask.price_cents + 1) / 2;
        let event = PriceChangedEvent {
            market,
            token,
            price_cents: mid,
            timestamp_ms: now_ms(),
        };
        self.handlers.emit(&event);
        self.metrics.events_emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Best level of one side: max price for bids, min for asks.
fn top_level(levels: &[WireLevel], is_bid: bool) -> Option<SideQuote> {
    let mut best: Option<SideQuote> = None;
    for level in levels {
        let Some(price) = parse_price_cents(&level.price) else {
            continue;
        };
        let size = parse_size(&level.size).unwrap_or(0.0);
        let better = match best {
            None => true,
            Some(b) => {
                if is_bid {
                    price > b.price_cents
                } else {
                    price < b.price_cents
                }
            }
        };
        if better {
            best = Some(SideQuote {
                price_cents: price,
                size,
            });
        }
    }
    best
}
