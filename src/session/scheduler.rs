//! Cycle rotation.
//!
//! The scheduler is the sole authority on cycle identity: it computes
//! period boundaries from the slug grammar, fetches the next market's
//! metadata, rotates the session (in-socket resubscribe preferred, fresh
//! session as fallback) and owns the fail-safe pause when metadata cannot
//! be obtained.

use anyhow::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::exec::metadata::MarketInfoFetcher;
use crate::exec::trading::TradingService;
use crate::market::best_book::AtomicBestBook;
use crate::market::stream::{MarketDataStream, StreamConfig};
use crate::market::user_stream::{ApiCredentials, UserDataStream, UserStreamConfig};
use crate::models::{
    build_slug, current_period_start_unix, now_ms, now_secs, slug_timeframe_secs, Market,
};
use crate::session::router::SessionEventRouter;
use crate::session::session::Session;
use crate::strategy::Strategy;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Slug prefix carrying the timeframe segment, e.g. `btc-updown-15m`.
    pub slug_prefix: String,
    /// Wake this far before the cycle boundary.
    pub prewake: Duration,
    /// Upper bound on any single sleep, to stay responsive to drift.
    pub max_sleep: Duration,
    /// Retry period for the pending fetch while paused.
    pub pause_retry: Duration,
    /// False in tests: never dial real sockets.
    pub spawn_streams: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slug_prefix: "btc-updown-15m".to_string(),
            prewake: Duration::from_millis(500),
            max_sleep: Duration::from_secs(30),
            pause_retry: Duration::from_secs(5),
            spawn_streams: true,
        }
    }
}

impl SchedulerConfig {
    pub fn timeframe_secs(&self) -> i64 {
        slug_timeframe_secs(&self.slug_prefix)
    }
}

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub rotations: AtomicU64,
    pub switches: AtomicU64,
    pub fallback_sessions: AtomicU64,
    pub pauses: AtomicU64,
    pub resumes: AtomicU64,
    pub fetch_failures: AtomicU64,
}

impl SchedulerMetrics {
    pub fn summary(&self) -> String {
        format!(
            "rotations={} switches={} fallback_sessions={} pauses={} resumes={} fetch_failures={}",
            self.rotations.load(Ordering::Relaxed),
            self.switches.load(Ordering::Relaxed),
            self.fallback_sessions.load(Ordering::Relaxed),
            self.pauses.load(Ordering::Relaxed),
            self.resumes.load(Ordering::Relaxed),
            self.fetch_failures.load(Ordering::Relaxed),
        )
    }
}

pub struct MarketScheduler {
    cfg: SchedulerConfig,
    stream_cfg: StreamConfig,
    user_cfg: Option<(UserStreamConfig, ApiCredentials)>,
    fetcher: Arc<dyn MarketInfoFetcher>,
    trading: Arc<dyn TradingService>,
    router: Arc<SessionEventRouter>,
    strategies: RwLock<Vec<Arc<dyn Strategy>>>,
    /// One book cell for the whole process; rotation resets it in place.
    book: Arc<AtomicBestBook>,
    current: RwLock<Option<Arc<Session>>>,
    /// Slug awaiting a successful fetch while paused.
    pending: RwLock<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    metrics: SchedulerMetrics,
}

impl MarketScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        stream_cfg: StreamConfig,
        user_cfg: Option<(UserStreamConfig, ApiCredentials)>,
        fetcher: Arc<dyn MarketInfoFetcher>,
        trading: Arc<dyn TradingService>,
        router: Arc<SessionEventRouter>,
        book: Arc<AtomicBestBook>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            stream_cfg,
            user_cfg,
            fetcher,
            trading,
            router,
            strategies: RwLock::new(Vec::new()),
            book,
            current: RwLock::new(None),
            pending: RwLock::new(None),
            shutdown_tx,
            metrics: SchedulerMetrics::default(),
        })
    }

    pub fn add_strategy(&self, strategy: Arc<dyn Strategy>) {
        self.strategies.write().push(strategy);
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.current.read().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.pending.read().is_some()
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Slug of the period containing `now`.
    pub fn slug_for(&self, now_secs: i64) -> String {
        let start = current_period_start_unix(now_secs, self.cfg.timeframe_secs());
        build_slug(&self.cfg.slug_prefix, start)
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Boot into the current period.
        let slug = self.slug_for(now_secs());
        if let Err(e) = self.start_cycle(&slug).await {
            warn!(slug, error = %e, "initial_cycle_fetch_failed");
            self.enter_pause(slug, &e.to_string()).await;
        }

        loop {
            let nap = self.next_sleep();
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = sleep(nap) => {}
            }

            if self.is_paused() {
                self.retry_pending().await;
                continue;
            }

            let cycle_end = match self.current_session() {
                Some(session) => session.market().cycle_end(),
                None => {
                    let slug = self.slug_for(now_secs());
                    if let Err(e) = self.start_cycle(&slug).await {
                        self.enter_pause(slug, &e.to_string()).await;
                    }
                    continue;
                }
            };

            if now_secs() >= cycle_end {
                self.rotate().await;
            }
        }

        if let Some(session) = self.current.write().take() {
            session.close();
        }
        self.router.set_session(None);
        info!(metrics = %self.metrics.summary(), "scheduler_exit");
    }

    /// Sleep until just before the boundary, never longer than `max_sleep`.
    fn next_sleep(&self) -> Duration {
        if self.is_paused() {
            return self.cfg.pause_retry;
        }
        let Some(session) = self.current_session() else {
            return Duration::from_secs(1);
        };
        let target_ms = session.market().cycle_end() * 1000 - self.cfg.prewake.as_millis() as i64;
        let remaining_ms = (target_ms - now_ms()).max(0) as u64;
        Duration::from_millis(remaining_ms).min(self.cfg.max_sleep)
    }

    // ------------------------------------------------------------------
    // Rotation steps
    // ------------------------------------------------------------------

    /// Fetch and install the cycle for `slug` as a fresh session, then
    /// announce it to the strategies.
    pub async fn start_cycle(&self, slug: &str) -> Result<()> {
        let market = Arc::new(self.fetcher.fetch_market_info(slug).await?);
        self.install_fresh_session(market.clone());
        self.fire_on_cycle(None, market);
        Ok(())
    }

    /// Rotate at a cycle boundary. Prefers the in-socket market switch;
    /// falls back to a fresh session when the resubscribe cannot be sent.
    pub async fn rotate(&self) {
        let Some(session) = self.current_session() else {
            return;
        };
        let old_market = session.market();
        let timeframe = self.cfg.timeframe_secs();
        let next_start = old_market
            .cycle_end()
            .max(current_period_start_unix(now_secs(), timeframe));
        let slug = build_slug(&self.cfg.slug_prefix, next_start);

        let market = match self.fetcher.fetch_market_info(&slug).await {
            Ok(m) => Arc::new(m),
            Err(e) => {
                self.enter_pause(slug, &e.to_string()).await;
                return;
            }
        };

        self.metrics.rotations.fetch_add(1, Ordering::Relaxed);
        info!(old = %old_market.slug, new = %market.slug, "cycle_rotation");

        // Switch path. Ordering is load-bearing: stale snapshot data must
        // be cleared and handlers re-announced before the new book flows.
        let mds = session.mds();
        mds.prepare_switch(market.clone());
        session.update_market(market.clone());
        self.trading.set_current_market_info(market.clone());
        self.fire_on_cycle(Some(old_market.clone()), market.clone());

        match mds.resubscribe() {
            Ok(()) => {
                self.metrics.switches.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "in_socket_switch_failed: falling back to fresh session");
                self.metrics
                    .fallback_sessions
                    .fetch_add(1, Ordering::Relaxed);
                self.install_fresh_session(market);
            }
        }
    }

    /// Build a new session (closing any old one), rebind the router and
    /// re-attach every strategy. Does not fire `on_cycle`.
    fn install_fresh_session(&self, market: Arc<Market>) {
        if let Some(old) = self.current.write().take() {
            old.close();
        }
        // The shared book cell survives sessions; clear it in place.
        self.book.reset();

        let mds = MarketDataStream::new(self.stream_cfg.clone(), market.clone(), self.book.clone());
        let uds = self.user_cfg.as_ref().map(|(cfg, creds)| {
            let uds = UserDataStream::new(cfg.clone(), creds.clone());
            self.router.register_with_user_stream(&uds);
            uds
        });

        let session = Session::new(market.clone(), mds.clone(), uds.clone());
        for strategy in self.strategies.read().iter() {
            strategy.attach(&session);
        }
        session.spawn();
        if self.cfg.spawn_streams {
            mds.spawn();
            if let Some(uds) = &uds {
                uds.spawn();
            }
        }

        self.trading.set_current_market_info(market.clone());
        self.router.set_session(Some(session.clone()));
        *self.current.write() = Some(session);
        info!(slug = %market.slug, "fresh_session_installed");
    }

    fn fire_on_cycle(&self, old: Option<Arc<Market>>, new: Arc<Market>) {
        for strategy in self.strategies.read().iter() {
            strategy.on_cycle(old.clone(), new.clone());
        }
    }

    // ------------------------------------------------------------------
    // Fail-safe pause
    // ------------------------------------------------------------------

    /// Metadata is unavailable: flatten the order book exposure, pause the
    /// trading service, drop the session, and keep retrying.
    pub async fn enter_pause(&self, slug: String, cause: &str) {
        self.metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
        if self.is_paused() {
            // Already paused: just keep the newest target slug.
            *self.pending.write() = Some(slug);
            return;
        }
        self.metrics.pauses.fetch_add(1, Ordering::Relaxed);
        error!(slug, cause, "scheduler_pause");

        match self.trading.cancel_orders_for_market("").await {
            Ok(n) => info!(canceled = n, "pause_cancel_all"),
            Err(e) => warn!(error = %e, "pause_cancel_all_failed"),
        }
        self.trading
            .pause_trading(&format!("cycle metadata unavailable ({cause})"));

        if let Some(session) = self.current.write().take() {
            session.close();
        }
        self.router.set_session(None);
        *self.pending.write() = Some(slug);
    }

    /// One retry of the pending fetch. Successful fetch resumes trading.
    pub async fn retry_pending(&self) {
        let Some(mut slug) = self.pending.read().clone() else {
            return;
        };
        // A long pause can outlive the pending cycle; target the period
        // that is actually current again.
        let timeframe = self.cfg.timeframe_secs();
        if let Some(ts) = crate::models::slug_timestamp(&slug) {
            if now_secs() >= ts + timeframe {
                slug = self.slug_for(now_secs());
            }
        }

        match self.fetcher.fetch_market_info(&slug).await {
            Ok(market) => {
                let market = Arc::new(market);
                info!(slug = %market.slug, "pause_recovered");
                *self.pending.write() = None;
                self.install_fresh_session(market.clone());
                self.trading.resume_trading();
                self.metrics.resumes.fetch_add(1, Ordering::Relaxed);
                self.fire_on_cycle(None, market);
            }
            Err(e) => {
                self.metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
                debug!(slug, error = %e, "pause_retry_failed");
            }
        }
    }
}
