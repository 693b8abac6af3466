//! End-to-end scenarios against the assembled engine: market stream frames
//! in, paper-venue fills out, with the session, router and strategy loops
//! running for real. No sockets are opened; frames are driven through the
//! stream's frame processor exactly as the reader task would.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use updown_core::config::EngineConfig;
use updown_core::exec::command::{CommandExecutor, ExecutionMode};
use updown_core::exec::metadata::StaticMarketFetcher;
use updown_core::exec::trading::{PaperTradingService, TradingService, PAUSED_REASON_PREFIX};
use updown_core::market::best_book::AtomicBestBook;
use updown_core::market::stream::{MarketDataStream, StreamConfig};
use updown_core::models::{
    build_slug, current_period_start_unix, now_ms, now_secs, Market, Order, OrderType,
    PriceChangedEvent, Side, TokenKind,
};
use updown_core::session::router::SessionEventRouter;
use updown_core::session::scheduler::{MarketScheduler, SchedulerConfig};
use updown_core::session::session::Session;
use updown_core::strategy::pair_lock::{PairLockConfig, PairLockStrategy};
use updown_core::strategy::win_bet::{WinBetConfig, WinBetStrategy};
use updown_core::strategy::Strategy;

struct Engine {
    book: Arc<AtomicBestBook>,
    trading: Arc<PaperTradingService>,
    market: Arc<Market>,
    mds: Arc<MarketDataStream>,
    session: Arc<Session>,
    /// Held so the router (and its registration) lives as long as the rig.
    _router: Arc<SessionEventRouter>,
}

/// Assemble stream -> session -> router -> paper venue for a market that is
/// 60 seconds into a 15-minute cycle.
fn engine() -> Engine {
    let book = Arc::new(AtomicBestBook::new());
    let trading = PaperTradingService::new(book.clone());
    let market = Arc::new(Market::new(
        format!("btc-updown-15m-{}", now_secs() - 60),
        "0xcond",
        "yes-asset",
        "no-asset",
    ));
    trading.set_current_market_info(market.clone());

    let mds = MarketDataStream::new(StreamConfig::default(), market.clone(), book.clone());
    let session = Session::new(market.clone(), mds.clone(), None);
    session.spawn();

    let router = SessionEventRouter::new();
    router.register_with(trading.as_ref());
    router.set_session(Some(session.clone()));

    Engine {
        book,
        trading,
        market,
        mds,
        session,
        _router: router,
    }
}

fn book_frame(asset: &str, bid_cents: i64, ask_cents: i64) -> String {
    format!(
        r#"{{"event_type":"book","asset_id":"{asset}","best_bid":"{:.2}","best_ask":"{:.2}"}}"#,
        bid_cents as f64 / 100.0,
        ask_cents as f64 / 100.0,
    )
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// S1: paired-lock happy path
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn s1_pair_lock_happy_path() {
    let e = engine();
    let executor = CommandExecutor::spawn(ExecutionMode::Serial, 1024);
    let strategy = PairLockStrategy::new(
        PairLockConfig {
            profit_target_cents: 3,
            order_size: 2.0,
            ..PairLockConfig::default()
        },
        e.trading.clone(),
        executor,
    );
    strategy.spawn();
    strategy.attach(&e.session);
    strategy.on_cycle(None, e.market.clone());
    settle(100).await;

    // 48c + 49c = 97 <= 100 - 3: one plan, two FAK buys, both filled.
    e.mds.process_text_frame(&book_frame("yes-asset", 46, 48));
    e.mds.process_text_frame(&book_frame("no-asset", 47, 49));
    settle(200).await;
    // Re-announce the book: if the first quote raced the second frame the
    // retry triggers here, and a completed plan blocks it via cooldown.
    e.mds.process_text_frame(&book_frame("yes-asset", 46, 48));
    settle(600).await;

    assert_eq!(
        strategy.metrics().plans_created.load(Ordering::Relaxed),
        1,
        "exactly one plan: {}",
        strategy.metrics().summary()
    );
    assert_eq!(strategy.metrics().plans_completed.load(Ordering::Relaxed), 1);
    assert_eq!(strategy.metrics().trades_this_cycle.load(Ordering::Relaxed), 1);

    let positions = e
        .trading
        .get_open_positions_for_market(&e.market.slug)
        .await
        .unwrap();
    assert_eq!(positions.len(), 2);
    for position in positions {
        assert!((position.size - 2.0).abs() < 1e-9);
    }
    // Profit bound: both legs bought at ask, 48 + 49 <= 97.
    let orders = e.trading.get_active_orders().await.unwrap();
    assert!(orders.is_empty(), "no resting orders after FAK pair");
}

// ============================================================================
// S3: velocity trigger + complementary hedge, hedge fills
// ============================================================================

fn win_bet_cfg() -> WinBetConfig {
    WinBetConfig {
        cooldown_ms: 0,
        per_market_cooldown_ms: 0,
        ..WinBetConfig::default()
    }
}

async fn ramp_up(e: &Engine) {
    // UP mid climbs 51 -> 55; velocity = 4c / 10s window = 0.4 c/s. The
    // DOWN side stays put so only UP qualifies.
    e.mds.process_text_frame(&book_frame("no-asset", 43, 44));
    for (bid, ask) in [(50, 52), (51, 53), (52, 54), (53, 55), (54, 55)] {
        e.mds.process_text_frame(&book_frame("yes-asset", bid, ask));
        settle(30).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_velocity_entry_and_hedge_fill() {
    let e = engine();
    let executor = CommandExecutor::spawn(ExecutionMode::Serial, 1024);
    let strategy = WinBetStrategy::new(
        win_bet_cfg(),
        e.trading.clone(),
        executor,
        e.book.clone(),
    );
    strategy.spawn();
    strategy.attach(&e.session);
    strategy.on_cycle(None, e.market.clone());
    settle(100).await;

    ramp_up(&e).await;
    settle(600).await;

    assert_eq!(
        strategy.metrics().entries_filled.load(Ordering::Relaxed),
        1,
        "entry filled: {}",
        strategy.metrics().summary()
    );
    assert!(strategy.has_open_exposure());

    // One resting GTC hedge on the DOWN side, priced complementarily:
    // hedge <= 100 - entry - offset and strictly below the DOWN ask.
    let resting = e.trading.get_active_orders().await.unwrap();
    assert_eq!(resting.len(), 1);
    let hedge = &resting[0];
    assert_eq!(hedge.token, Some(TokenKind::Down));
    assert_eq!(hedge.order_type, OrderType::Gtc);
    assert!(hedge.price_cents < 44);

    // DOWN ask drops through the hedge limit: the venue crank fills it and
    // the exposure resolves through the order-update path.
    e.mds.process_text_frame(&book_frame("no-asset", 41, 42));
    e.trading.crank();
    settle(400).await;

    assert!(!strategy.has_open_exposure());
    assert_eq!(
        strategy.metrics().exposures_resolved.load(Ordering::Relaxed),
        1
    );
}

// ============================================================================
// S4: aggressive hedge escalation after cancel confirmation
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn s4_aggressive_hedge_escalation() {
    let e = engine();
    let executor = CommandExecutor::spawn(ExecutionMode::Serial, 1024);
    let strategy = WinBetStrategy::new(
        WinBetConfig {
            // Escalate fast; never take the reorder path first.
            aggressive_hedge_timeout_secs: 1,
            hedge_reorder_timeout_secs: 600,
            ..win_bet_cfg()
        },
        e.trading.clone(),
        executor,
        e.book.clone(),
    );
    strategy.spawn();
    strategy.attach(&e.session);
    strategy.on_cycle(None, e.market.clone());
    settle(100).await;

    ramp_up(&e).await;
    settle(400).await;
    assert!(strategy.has_open_exposure());
    let resting = e.trading.get_active_orders().await.unwrap();
    let hedge_id = resting[0].order_id.clone();

    // Let the aggressive timeout pass; the monitor cancels, confirms the
    // cancel by polling, then sends the taker FAK at the current DOWN ask.
    settle(2_500).await;

    let old_hedge = e.trading.get_order(&hedge_id).await.unwrap().unwrap();
    assert_eq!(old_hedge.status.to_string(), "canceled");
    assert_eq!(
        strategy
            .metrics()
            .aggressive_escalations
            .load(Ordering::Relaxed),
        1
    );
    assert!(!strategy.has_open_exposure(), "FAK at 44c resolved the pair");
    // No order overlap: at most one hedge was live at any time, and nothing
    // rests now.
    assert!(e.trading.get_active_orders().await.unwrap().is_empty());
}

// ============================================================================
// S5: cycle rotation resets the book and isolates old-cycle events
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn s5_cycle_rotation_isolation() {
    let book = Arc::new(AtomicBestBook::new());
    let trading = PaperTradingService::new(book.clone());
    let router = SessionEventRouter::new();
    router.register_with(trading.as_ref());

    let fetcher = Arc::new(StaticMarketFetcher::new());
    let cfg = SchedulerConfig {
        spawn_streams: false,
        ..SchedulerConfig::default()
    };
    let scheduler = MarketScheduler::new(
        cfg,
        StreamConfig::default(),
        None,
        fetcher.clone(),
        trading.clone(),
        router.clone(),
        book.clone(),
    );

    let executor = CommandExecutor::spawn(ExecutionMode::Serial, 1024);
    let strategy = PairLockStrategy::new(
        PairLockConfig::default(),
        trading.clone(),
        executor,
    );
    strategy.spawn();
    scheduler.add_strategy(strategy.clone());

    let tf = 900;
    let start = current_period_start_unix(now_secs(), tf);
    let slug_a = build_slug("btc-updown-15m", start);
    let slug_b = build_slug("btc-updown-15m", start + tf);
    fetcher.insert(Market::new(&slug_a, "c-a", "a-yes", "a-no"));
    fetcher.insert(Market::new(&slug_b, "c-b", "b-yes", "b-no"));

    scheduler.start_cycle(&slug_a).await.unwrap();
    let session = scheduler.current_session().unwrap();
    let market_a = session.market();

    // Dirty the book, then rotate: the shared cell is cleared in place.
    book.update_token(TokenKind::Up, 48, 52, 0, 0);
    scheduler.rotate().await;
    assert_eq!(book.load().yes_bid, 0);
    assert_eq!(scheduler.current_session().unwrap().market().slug, slug_b);

    // Old-cycle events offered after the switch never reach strategies.
    let signals_before = strategy.metrics().signals.load(Ordering::Relaxed);
    session.offer_price(PriceChangedEvent {
        market: market_a,
        token: TokenKind::Up,
        price_cents: 50,
        timestamp_ms: now_ms(),
    });
    settle(200).await;
    assert_eq!(
        strategy.metrics().signals.load(Ordering::Relaxed),
        signals_before
    );
    assert_eq!(
        session.metrics().price_filtered_cycle.load(Ordering::Relaxed),
        1
    );
}

// ============================================================================
// S6: fail-safe pause and recovery
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn s6_fail_safe_pause() {
    let book = Arc::new(AtomicBestBook::new());
    let trading = PaperTradingService::new(book.clone());
    let router = SessionEventRouter::new();
    router.register_with(trading.as_ref());

    let fetcher = Arc::new(StaticMarketFetcher::new());
    let cfg = SchedulerConfig {
        spawn_streams: false,
        ..SchedulerConfig::default()
    };
    let scheduler = MarketScheduler::new(
        cfg,
        StreamConfig::default(),
        None,
        fetcher.clone(),
        trading.clone(),
        router.clone(),
        book.clone(),
    );

    let start = current_period_start_unix(now_secs(), 900);
    let slug = build_slug("btc-updown-15m", start);
    let market = Market::new(&slug, "c", "yes", "no");
    fetcher.insert(market.clone());
    // The next cycle becomes fetchable once the outage clears.
    fetcher.insert(Market::new(
        &build_slug("btc-updown-15m", start + 900),
        "c2",
        "yes2",
        "no2",
    ));
    scheduler.start_cycle(&slug).await.unwrap();

    // A resting order to be swept by the pause.
    trading
        .place_order(Order::request(
            market.slug.clone(),
            market.yes_asset_id.clone(),
            Some(TokenKind::Up),
            Side::Buy,
            40,
            1.0,
            OrderType::Gtc,
        ))
        .await
        .unwrap();

    // Three consecutive fetch failures: pause once, keep retrying.
    fetcher.set_failing(true);
    scheduler.rotate().await;
    scheduler.retry_pending().await;
    scheduler.retry_pending().await;

    assert!(scheduler.is_paused());
    assert!(trading.get_active_orders().await.unwrap().is_empty());
    let err = trading
        .place_order(Order::request(
            market.slug.clone(),
            market.yes_asset_id.clone(),
            Some(TokenKind::Up),
            Side::Buy,
            40,
            1.0,
            OrderType::Gtc,
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with(PAUSED_REASON_PREFIX));
    assert_eq!(scheduler.metrics().pauses.load(Ordering::Relaxed), 1);

    // First successful fetch: fresh session, resumed trading.
    fetcher.set_failing(false);
    scheduler.retry_pending().await;
    assert!(!scheduler.is_paused());
    assert!(trading.paused_reason().is_none());
    assert!(scheduler.current_session().is_some());
    assert!(trading
        .place_order(Order::request(
            market.slug.clone(),
            market.yes_asset_id.clone(),
            Some(TokenKind::Up),
            Side::Buy,
            40,
            1.0,
            OrderType::Gtc,
        ))
        .await
        .is_ok());
}

// ============================================================================
// Live-fill path: user stream -> router -> session -> strategy handlers
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn user_stream_fills_flow_through_router_and_session() {
    use updown_core::market::user_stream::{ApiCredentials, UserDataStream, UserStreamConfig};
    use updown_core::models::OrderStatus;

    let e = engine();
    let uds = UserDataStream::new(
        UserStreamConfig::default(),
        ApiCredentials {
            apikey: "k".into(),
            secret: "s".into(),
            passphrase: "p".into(),
        },
    );

    // Two order events land before any handler exists: buffered, not lost.
    let frame = |msg_type: &str, matched: &str| {
        format!(
            r#"{{
                "event_type": "order",
                "id": "live-1",
                "type": "{msg_type}",
                "market": "",
                "asset_id": "yes-asset",
                "side": "BUY",
                "price": "0.48",
                "original_size": "2.0",
                "size_matched": "{matched}"
            }}"#
        )
    };
    uds.process_text_frame(&frame("PLACEMENT", "0"));
    uds.process_text_frame(&frame("UPDATE", "2.0"));

    let seen: Arc<parking_lot::Mutex<Vec<(String, OrderStatus, Option<TokenKind>)>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    e.session.on_order_update(Arc::new(move |o: &updown_core::models::Order| {
        sink.lock()
            .push((o.order_id.clone(), o.status, o.token));
    }));

    // First registration flushes the buffer straight into the router.
    e._router.register_with_user_stream(&uds);
    settle(200).await;

    let events = seen.lock().clone();
    assert_eq!(events.len(), 2, "buffered events delivered in arrival order");
    assert_eq!(events[0].1, OrderStatus::Open);
    assert_eq!(events[1].1, OrderStatus::Filled);
    // The session auto-populated the token from the asset id.
    assert_eq!(events[1].2, Some(TokenKind::Up));

    // A later frame flows straight through.
    uds.process_text_frame(&frame("CANCELLATION", "0"));
    settle(200).await;
    assert_eq!(seen.lock().len(), 3);
}

// ============================================================================
// Wiring sanity: defaults produce a runnable configuration
// ============================================================================

#[test]
fn default_engine_config_is_coherent() {
    let cfg = EngineConfig::default();
    assert!(cfg.executor_queue >= 1024);
    assert_eq!(cfg.stream.max_spread_cents, 10);
    assert!(cfg.enable_pair_lock && cfg.enable_win_bet);
}
