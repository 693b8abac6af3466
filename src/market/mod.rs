pub mod best_book;
pub mod handler_list;
pub mod quality;
pub mod stability;
pub mod stream;
pub mod user_stream;

pub use best_book::{AtomicBestBook, BestBookSnapshot};
pub use handler_list::{Handler, HandlerList};
pub use quality::{evaluate as evaluate_quality, Deduction, MarketQuality, QualityConfig};
pub use stability::{StabilityConfig, StabilityVerdict, StabilityWindow};
pub use stream::{ConnState, MarketDataStream, StreamConfig, StreamMetrics};
pub use user_stream::{ApiCredentials, UserDataStream, UserStreamConfig, UserStreamMetrics};
