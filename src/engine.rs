//! Run engine and background runner.
//!
//! The engine turns the workflow's return value into persisted run state:
//! - `Ok(outcome)` -> completed or aborted
//! - `Interrupt::Suspended` -> sleeping until the requested instant
//! - retryable step failure -> requeued with exponential backoff
//! - anything else -> failed
//!
//! [`spawn_runner`] polls the store for due runs and replays them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::substrate::{
    BackendError, BackendResult, Clock, DurableContext, Interrupt, RunFinish, RunId,
    RunStore, WorkflowRun,
};
use crate::workflow::{ReminderWorkflow, WorkflowOutcome};

/// Whole-run retry policy for retryable failures (e.g. the lookup store
/// being unreachable). Dispatch failures are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RunRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RunRetryPolicy {
    /// Delay before retrying after `failed_attempts` failures so far.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(failed_attempts))
            .min(self.max_delay)
    }
}

/// Replays reminder runs against a store.
pub struct ReminderEngine {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    workflow: ReminderWorkflow,
    retry: RunRetryPolicy,
    wake: Arc<Notify>,
}

impl ReminderEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        workflow: ReminderWorkflow,
        retry: RunRetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            workflow,
            retry,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Start a run for `subscription_id`. The run executes out of band.
    pub async fn trigger(&self, subscription_id: &str) -> BackendResult<WorkflowRun> {
        let run = self
            .store
            .create_run(subscription_id, self.clock.now())
            .await?;
        info!(run_id = %run.id, subscription_id, "reminder run queued");
        self.wake.notify_one();
        Ok(run)
    }

    pub async fn get_run(&self, run_id: RunId) -> BackendResult<Option<WorkflowRun>> {
        self.store.get_run(run_id).await
    }

    /// Replay one run from the start and persist where it ended.
    pub async fn replay(&self, run: &WorkflowRun) -> BackendResult<WorkflowRun> {
        let mut ctx = DurableContext::new(run.id, self.store.clone(), self.clock.clone());
        let result = self.workflow.run(&mut ctx, &run.subscription_id).await;
        let stats = ctx.stats();
        let now = self.clock.now();

        let finish = match result {
            Ok(outcome) => {
                let aborted = outcome.is_aborted();
                let outcome = outcome_json(&outcome)?;
                if aborted {
                    RunFinish::Aborted { outcome }
                } else {
                    RunFinish::Completed { outcome }
                }
            }
            Err(Interrupt::Suspended { label, until }) => {
                info!(run_id = %run.id, label = %label, wake_at = %until, "run suspended");
                RunFinish::Sleeping { wake_at: until }
            }
            Err(Interrupt::StepFailed { label, source }) => {
                let error = format!("step {label} failed: {source}");
                let failed_attempts = u32::try_from(run.attempts).unwrap_or(0);
                if source.retryable && failed_attempts + 1 < self.retry.max_attempts {
                    let delay = self.retry.delay(failed_attempts);
                    let wake_at = retry_at(now, delay);
                    warn!(run_id = %run.id, error = %error, %wake_at, "run failed; requeueing");
                    RunFinish::Retry { wake_at, error }
                } else {
                    error!(run_id = %run.id, error = %error, "run failed");
                    RunFinish::Failed { error }
                }
            }
            Err(Interrupt::Corrupt { label, source }) => {
                let error = format!("unreadable record for step {label}: {source}");
                error!(run_id = %run.id, error = %error, "run failed");
                RunFinish::Failed { error }
            }
            // The run stays leased; it is reclaimed once the lease expires.
            Err(Interrupt::Backend(err)) => return Err(err),
        };

        let updated = match self.store.finish_run(run, finish, now).await {
            Ok(updated) => updated,
            Err(err @ BackendError::LeaseLost(_)) => {
                warn!(run_id = %run.id, "lease lost before finishing; result discarded");
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        info!(
            run_id = %run.id,
            status = %updated.status,
            steps_executed = stats.steps_executed,
            steps_replayed = stats.steps_replayed,
            sleeps_satisfied = stats.sleeps_satisfied,
            "replay finished"
        );
        Ok(updated)
    }

    /// Claim due runs and replay them concurrently. Returns how many were
    /// replayed successfully.
    pub async fn tick(&self, batch_size: usize, lease: Duration) -> BackendResult<usize> {
        let runs = self
            .store
            .claim_due_runs(self.clock.now(), lease, batch_size)
            .await?;
        if runs.is_empty() {
            return Ok(0);
        }

        let results = join_all(runs.iter().map(|run| self.replay(run))).await;
        let mut replayed = 0;
        for (run, result) in runs.iter().zip(results) {
            match result {
                Ok(_) => replayed += 1,
                Err(err) => error!(run_id = %run.id, error = %err, "failed to replay run"),
            }
        }
        Ok(replayed)
    }

    /// Replay due runs until none are left. Mostly useful in tests.
    pub async fn drain(&self, batch_size: usize, lease: Duration) -> BackendResult<usize> {
        let mut total = 0;
        loop {
            let replayed = self.tick(batch_size, lease).await?;
            if replayed == 0 {
                return Ok(total);
            }
            total += replayed;
        }
    }
}

fn outcome_json(outcome: &WorkflowOutcome) -> BackendResult<serde_json::Value> {
    serde_json::to_value(outcome).map_err(BackendError::from)
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

/// Runner loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub lease: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            lease: Duration::from_secs(300),
        }
    }
}

/// Spawn the background runner. Send `true` on the returned channel to stop it.
pub fn spawn_runner(
    engine: Arc<ReminderEngine>,
    config: RunnerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake = engine.wake.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            poll_interval_ms = config.poll_interval.as_millis(),
            batch_size = config.batch_size,
            "reminder runner started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reminder runner shutting down");
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = engine.drain(config.batch_size, config.lease).await {
                error!(error = %err, "runner tick failed");
            }
        }
    });

    (handle, shutdown_tx)
}
