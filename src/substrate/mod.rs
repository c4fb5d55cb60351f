//! Durable execution substrate.
//!
//! Provides the two replay-safe primitives the reminder workflow is built on
//! (`step` and `sleep_until`), the run-log storage contract behind them, and
//! two storage backends:
//! - [`MemoryRunStore`]: process-local, used by tests and local development
//! - [`PostgresRunStore`]: sqlx + PostgreSQL, safe to share between runners

mod base;
mod clock;
mod context;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, RunFinish, RunId, RunStatus, RunStore, SleepRecord, StepRecord,
    WorkflowRun,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{DurableContext, Interrupt, ReplayStats, StepError};
pub use memory::MemoryRunStore;
pub use postgres::PostgresRunStore;
