//! Engine binary: wire the core together and run until ctrl-c.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use updown_core::config::EngineConfig;
use updown_core::exec::command::{CommandExecutor, ExecutionMode};
use updown_core::exec::metadata::{
    HttpMarketInfoFetcher, MarketInfoFetcher, SyntheticMarketFetcher,
};
use updown_core::exec::trading::PaperTradingService;
use updown_core::market::best_book::AtomicBestBook;
use updown_core::session::router::SessionEventRouter;
use updown_core::session::scheduler::MarketScheduler;
use updown_core::status::{StatusRegistry, SNAPSHOT_BUDGET};
use updown_core::strategy::pair_lock::PairLockStrategy;
use updown_core::strategy::win_bet::WinBetStrategy;

#[derive(Debug, Parser)]
#[command(name = "updown", about = "Up/down cycle trading engine")]
struct Args {
    /// Path to a TOML config overlay.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force paper mode (simulated venue, synthetic metadata).
    #[arg(long)]
    paper: bool,

    /// Log filter, e.g. `info,updown_core=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if args.paper {
        config.paper = true;
    }
    info!(
        slug_prefix = %config.slug_prefix,
        paper = config.paper,
        pair_lock = config.enable_pair_lock,
        win_bet = config.enable_win_bet,
        "engine_starting"
    );

    // One top-of-book cell for the whole process; cycle rotation resets it
    // in place.
    let book = Arc::new(AtomicBestBook::new());

    // The exchange-facing trading service is an external collaborator; this
    // binary ships the paper venue, which fills against the live book.
    let trading = PaperTradingService::new(book.clone());
    trading.spawn_crank(Duration::from_millis(250));

    let router = SessionEventRouter::new();
    router.register_with(trading.as_ref() as &dyn updown_core::TradingService);

    let fetcher: Arc<dyn MarketInfoFetcher> = if config.paper {
        Arc::new(SyntheticMarketFetcher)
    } else {
        Arc::new(HttpMarketInfoFetcher::new(config.metadata_base_url.clone()))
    };

    let user_cfg = match (&config.credentials, config.paper) {
        (Some(creds), false) => Some((config.user_stream.clone(), creds.clone())),
        (None, false) => {
            warn!("no credentials configured: running without a user stream");
            None
        }
        _ => None,
    };

    let scheduler = MarketScheduler::new(
        config.scheduler.clone(),
        config.stream.clone(),
        user_cfg,
        fetcher,
        trading.clone(),
        router.clone(),
        book.clone(),
    );

    let mut pair_lock = None;
    if config.enable_pair_lock {
        let executor = CommandExecutor::spawn(ExecutionMode::Serial, config.executor_queue);
        let strategy =
            PairLockStrategy::new(config.pair_lock.clone(), trading.clone(), executor.clone());
        strategy.spawn();
        scheduler.add_strategy(strategy.clone());
        pair_lock = Some((strategy, executor));
    }

    let mut win_bet = None;
    if config.enable_win_bet {
        let executor = CommandExecutor::spawn(ExecutionMode::Serial, config.executor_queue);
        let strategy = WinBetStrategy::new(
            config.win_bet.clone(),
            trading.clone(),
            executor.clone(),
            book.clone(),
        );
        strategy.spawn();
        scheduler.add_strategy(strategy.clone());
        win_bet = Some((strategy, executor));
    }

    // Dashboard-facing status surface plus a periodic heartbeat log.
    let status = StatusRegistry::new();
    {
        let s = scheduler.clone();
        status.register("scheduler", Arc::new(move || s.metrics().summary()));
        let t = trading.clone();
        status.register("venue", Arc::new(move || t.metrics().summary()));
        if let Some((strategy, _)) = &pair_lock {
            let s = strategy.clone();
            status.register("pair_lock", Arc::new(move || s.metrics().summary()));
        }
        if let Some((strategy, _)) = &win_bet {
            let s = strategy.clone();
            status.register("win_bet", Arc::new(move || s.metrics().summary()));
        }
    }
    {
        let status = status.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let snap = status.snapshot(SNAPSHOT_BUDGET);
                for field in &snap.fields {
                    info!(subsystem = field.name, status = %field.value, "heartbeat");
                }
            }
        });
    }

    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.run().await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown_requested");

    scheduler.shutdown();
    if let Some((strategy, executor)) = &pair_lock {
        strategy.shutdown();
        executor.stop();
        info!(metrics = %strategy.metrics().summary(), "pair_lock_final");
        info!(metrics = %executor.metrics().summary(), "pair_lock_executor_final");
    }
    if let Some((strategy, executor)) = &win_bet {
        strategy.shutdown();
        executor.stop();
        info!(metrics = %strategy.metrics().summary(), "win_bet_final");
        info!(metrics = %executor.metrics().summary(), "win_bet_executor_final");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), scheduler_task).await;
    info!(metrics = %scheduler.metrics().summary(), "scheduler_final");
    info!(metrics = %trading.metrics().summary(), "paper_venue_final");
    info!("engine_stopped");
    Ok(())
}
