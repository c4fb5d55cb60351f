//! Replay-safe `step` and `sleep_until` primitives.
//!
//! A run's code is re-executed from the top on every resume. Each call made
//! through [`DurableContext`] is keyed by its label: if the run log already
//! holds a result for that label the call returns it without doing the work
//! again, otherwise the work is performed and recorded.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, info};

use super::base::{BackendError, RunId, RunStore, SleepRecord, StepRecord};
use super::clock::Clock;

/// Failure reported by the body of a step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    /// Whether re-running the whole run later may succeed.
    pub retryable: bool,
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Reasons a replay stops before the workflow returns.
#[derive(Debug, Error)]
pub enum Interrupt {
    /// The run reached a sleep point that is still in the future.
    #[error("suspended at {label} until {until}")]
    Suspended { label: String, until: DateTime<Utc> },

    #[error("step {label} failed: {source}")]
    StepFailed {
        label: String,
        #[source]
        source: StepError,
    },

    #[error("step {label} produced an unreadable record: {source}")]
    Corrupt {
        label: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Counters describing what one replay actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub steps_executed: u32,
    pub steps_replayed: u32,
    pub sleeps_satisfied: u32,
    pub sleeps_replayed: u32,
}

/// Handle a workflow uses to perform durable work for one run.
pub struct DurableContext {
    run_id: RunId,
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    stats: ReplayStats,
}

impl DurableContext {
    pub fn new(run_id: RunId, store: Arc<dyn RunStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            run_id,
            store,
            clock,
            stats: ReplayStats::default(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current wall-clock time. Not memoized; wrap in a step when a replay
    /// must observe the same value.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Run `body` at most once per label across replays and return its result.
    ///
    /// `body` gets a single attempt. Failures are not recorded: a failed step
    /// is attempted again only if the whole run is replayed.
    pub async fn step<T, F, Fut>(&mut self, label: &str, body: F) -> Result<T, Interrupt>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        if let Some(record) = self.store.load_step(self.run_id, label).await? {
            debug!(run_id = %self.run_id, label, "replaying recorded step");
            self.stats.steps_replayed += 1;
            return decode(label, record.output);
        }

        let value = body().await.map_err(|source| Interrupt::StepFailed {
            label: label.to_string(),
            source,
        })?;

        let output = serde_json::to_value(&value).map_err(BackendError::from)?;
        let stored = self
            .store
            .record_step(
                self.run_id,
                StepRecord {
                    label: label.to_string(),
                    output,
                    recorded_at: self.clock.now(),
                },
            )
            .await?;
        self.stats.steps_executed += 1;
        debug!(run_id = %self.run_id, label, "step recorded");

        // Another replay may have recorded first; its result is authoritative.
        decode(label, stored.output)
    }

    /// Suspend the run until `until`, once per label.
    ///
    /// The first call fixes the wake-up instant. While it is in the future
    /// this returns [`Interrupt::Suspended`], which the workflow propagates
    /// so the engine can park the run. Once the instant has passed the point
    /// is marked satisfied and later replays go straight through.
    pub async fn sleep_until(&mut self, label: &str, until: DateTime<Utc>) -> Result<(), Interrupt> {
        let now = self.clock.now();

        let until = match self.store.load_sleep(self.run_id, label).await? {
            Some(record) if record.is_satisfied() => {
                self.stats.sleeps_replayed += 1;
                return Ok(());
            }
            Some(record) => record.until,
            None => until,
        };

        let satisfied_at = (now >= until).then_some(now);
        self.store
            .record_sleep(
                self.run_id,
                SleepRecord {
                    label: label.to_string(),
                    until,
                    satisfied_at,
                },
            )
            .await?;

        if satisfied_at.is_some() {
            self.stats.sleeps_satisfied += 1;
            return Ok(());
        }

        info!(run_id = %self.run_id, label, %until, "sleeping until reminder");
        Err(Interrupt::Suspended {
            label: label.to_string(),
            until,
        })
    }
}

fn decode<T: DeserializeOwned>(label: &str, output: serde_json::Value) -> Result<T, Interrupt> {
    serde_json::from_value(output).map_err(|source| Interrupt::Corrupt {
        label: label.to_string(),
        source,
    })
}
