pub mod router;
pub mod scheduler;
pub mod session;

pub use router::SessionEventRouter;
pub use scheduler::{MarketScheduler, SchedulerConfig, SchedulerMetrics};
pub use session::{Session, SessionMetrics};
