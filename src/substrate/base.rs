//! Storage contract shared by the durable run-log backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers & Status
// ============================================================================

/// Unique identifier for one reminder run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting to be picked up (first start or retry after a failure)
    Queued,
    /// Claimed by a runner and currently replaying
    Running,
    /// Suspended on a `sleep_until` point
    Sleeping,
    Completed,
    /// Ended early because the subscription was ineligible
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "sleeping" => Some(Self::Sleeping),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the run will never be replayed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// A reminder run for one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub subscription_id: String,
    pub status: RunStatus,
    /// When the run should next be replayed. `None` once terminal.
    pub wake_at: Option<DateTime<Utc>>,
    /// Number of failed attempts that were requeued
    pub attempts: i32,
    pub last_error: Option<String>,
    pub outcome: Option<serde_json::Value>,
    /// Set while a runner holds the run; doubles as the claim token.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable result of a completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub label: String,
    pub output: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Durable state of a sleep point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepRecord {
    pub label: String,
    /// Instant fixed by the first call; replays never move it.
    pub until: DateTime<Utc>,
    pub satisfied_at: Option<DateTime<Utc>>,
}

impl SleepRecord {
    pub fn is_satisfied(&self) -> bool {
        self.satisfied_at.is_some()
    }
}

/// How a replay of a run ended, as persisted by [`RunStore::finish_run`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunFinish {
    Completed { outcome: serde_json::Value },
    Aborted { outcome: serde_json::Value },
    Sleeping { wake_at: DateTime<Utc> },
    /// Requeue the whole run after a retryable failure.
    Retry { wake_at: DateTime<Utc>, error: String },
    Failed { error: String },
}

impl RunFinish {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Aborted { .. } => RunStatus::Aborted,
            Self::Sleeping { .. } => RunStatus::Sleeping,
            Self::Retry { .. } => RunStatus::Queued,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("lease lost for run {0}")]
    LeaseLost(RunId),

    #[error("{0}")]
    Message(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

// ============================================================================
// Store
// ============================================================================

/// Persisted event log keyed by run id and label.
///
/// Every timestamp is passed in by the caller so that the engine's clock, not
/// the backend's, decides what "now" is.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a queued run that is due immediately.
    async fn create_run(&self, subscription_id: &str, now: DateTime<Utc>)
    -> BackendResult<WorkflowRun>;

    async fn get_run(&self, run_id: RunId) -> BackendResult<Option<WorkflowRun>>;

    /// Claim up to `limit` runs that are due at `now`, leasing them for `lease`.
    ///
    /// Due runs are queued or sleeping runs whose `wake_at` has passed, plus
    /// running runs whose lease expired (their runner died mid-replay).
    async fn claim_due_runs(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> BackendResult<Vec<WorkflowRun>>;

    /// Persist the end of a replay of `run`, as returned by
    /// [`Self::claim_due_runs`].
    ///
    /// Fails with [`BackendError::LeaseLost`] unless the run is still running
    /// under the same lease, so a runner whose lease expired cannot overwrite
    /// what a newer claimant wrote.
    async fn finish_run(
        &self,
        run: &WorkflowRun,
        finish: RunFinish,
        now: DateTime<Utc>,
    ) -> BackendResult<WorkflowRun>;

    async fn load_step(&self, run_id: RunId, label: &str) -> BackendResult<Option<StepRecord>>;

    /// Record a step result. The first record for a label wins; the stored
    /// record is returned so concurrent replays agree on one result.
    async fn record_step(&self, run_id: RunId, record: StepRecord) -> BackendResult<StepRecord>;

    /// Completed steps in the order they were recorded.
    async fn list_steps(&self, run_id: RunId) -> BackendResult<Vec<StepRecord>>;

    async fn load_sleep(&self, run_id: RunId, label: &str) -> BackendResult<Option<SleepRecord>>;

    /// Insert a sleep point or mark an existing one satisfied. The stored
    /// `until` is never changed once written.
    async fn record_sleep(&self, run_id: RunId, record: SleepRecord) -> BackendResult<SleepRecord>;

    async fn list_sleeps(&self, run_id: RunId) -> BackendResult<Vec<SleepRecord>>;
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
