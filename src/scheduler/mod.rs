//! Periodic tickers: the Pending Scheduler (C4) and the Anomaly Scheduler
//! (C8). Both run as independent long-running tasks bound to a root
//! cancellation token (§5 T1/T3).

pub mod anomaly;
pub mod pending;

pub use anomaly::AnomalyScheduler;
pub use pending::PendingScheduler;
