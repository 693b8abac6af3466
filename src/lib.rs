//! Real-time trading core for paired binary (up/down) prediction markets.
//!
//! Four subsystems compose the engine: the market data stream (resilient
//! WebSocket subscriber publishing a lock-free top-of-book), the market
//! scheduler (fixed-period cycle rotation with fail-safe pause), the
//! session event router (cross-cycle isolation), and the strategy
//! execution core (paired-lock arbitrage and velocity-follow hedged
//! entries behind a bounded command executor).

pub mod config;
pub mod exec;
pub mod market;
pub mod models;
pub mod session;
pub mod status;
pub mod strategy;

pub use config::EngineConfig;

// Re-export the working vocabulary for binaries and tests.
pub use exec::{
    CommandExecutor, ExecutionMode, MarketInfoFetcher, PaperTradingService, TradingService,
};
pub use market::{AtomicBestBook, BestBookSnapshot, HandlerList, MarketDataStream, UserDataStream};
pub use models::{Market, Order, OrderStatus, PriceChangedEvent, TokenKind};
pub use session::{MarketScheduler, Session, SessionEventRouter};
pub use strategy::{PairLockStrategy, Strategy, WinBetStrategy};
