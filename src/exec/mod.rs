pub mod command;
pub mod metadata;
pub mod trading;

pub use command::{Command, CommandExecutor, ExecutionMode, ExecutorMetrics};
pub use metadata::{
    HttpMarketInfoFetcher, MarketInfoFetcher, StaticMarketFetcher, SyntheticMarketFetcher,
};
pub use trading::{
    PaperTradingService, Position, QuoteSource, TopOfBook, TradingService, PAUSED_REASON_PREFIX,
};
