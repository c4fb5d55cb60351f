//! Renewal reminders - durable subscription renewal reminder workflows
//!
//! For one subscription, a run sends a reminder e-mail at each configured
//! offset before the renewal date (7, 5, 2 and 1 days by default). Runs are
//! durable: they sleep between reminders without holding a task, survive
//! process restarts, and never send the same reminder twice.
//!
//! ## Durable substrate
//!
//! - [`DurableContext`]: replay-safe `step` and `sleep_until`
//! - [`RunStore`]: run log storage, with [`MemoryRunStore`] and [`PostgresRunStore`]
//!
//! ## Reminders
//!
//! - [`schedule`]: pure reminder date calculation
//! - [`ReminderWorkflow`]: the per-subscription state machine
//! - [`ReminderEngine`]: persists run outcomes; [`spawn_runner`] drives due runs
//! - [`server`]: HTTP trigger and status endpoints

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod schedule;
pub mod server;
pub mod subscription;
pub mod substrate;
pub mod workflow;

pub use config::EngineConfig;
pub use dispatch::{
    DispatchError, DispatchReceipt, MailMessage, MailTransport, ReminderDispatcher,
    TemplateDispatcher, TracingTransport,
};
pub use engine::{ReminderEngine, RunRetryPolicy, RunnerConfig, spawn_runner};
pub use schedule::{MissedReminderPolicy, ReminderEvent, ReminderOffsets, ScheduleError};
pub use server::{HttpState, create_router};
pub use subscription::{
    InMemorySubscriptions, LookupError, PgSubscriptionLookup, Subscription, SubscriptionLookup,
    SubscriptionStatus, SubscriptionUser,
};
pub use substrate::{
    BackendError, BackendResult, Clock, DurableContext, Interrupt, ManualClock, MemoryRunStore,
    PostgresRunStore, RunId, RunStatus, RunStore, StepError, SystemClock, WorkflowRun,
};
pub use workflow::{AbortReason, ReminderSettings, ReminderWorkflow, WorkflowOutcome};
