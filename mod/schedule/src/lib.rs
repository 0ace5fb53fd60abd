//! Schedule module — cron-driven task creation with overlap policies,
//! per-execution timeouts, and execution history.

pub mod api;
pub mod engine;
pub mod model;
pub mod store;

pub use engine::{EngineConfig, ScheduleEngine};
pub use model::{OverlapPolicy, ScheduledExecution, ScheduledTask};
pub use store::ScheduleStore;
