//! In-memory run store for tests and local development.
//!
//! Mirrors the Postgres backend's claim and memoization rules without a
//! database, so the same workflow code can be exercised end to end.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::base::{
    BackendError, BackendResult, RunFinish, RunId, RunStatus, RunStore, SleepRecord, StepRecord,
    WorkflowRun, lease_deadline,
};

#[derive(Debug)]
struct RunEntry {
    run: WorkflowRun,
    steps: Vec<StepRecord>,
    sleeps: Vec<SleepRecord>,
}

/// Run store backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_due(entry: &RunEntry, now: DateTime<Utc>) -> bool {
    match entry.run.status {
        RunStatus::Queued | RunStatus::Sleeping => {
            entry.run.wake_at.is_some_and(|wake_at| wake_at <= now)
        }
        RunStatus::Running => entry
            .run
            .lease_expires_at
            .is_some_and(|expires_at| expires_at < now),
        RunStatus::Completed | RunStatus::Aborted | RunStatus::Failed => false,
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<WorkflowRun> {
        let run = WorkflowRun {
            id: RunId::new(),
            subscription_id: subscription_id.to_string(),
            status: RunStatus::Queued,
            wake_at: Some(now),
            attempts: 0,
            last_error: None,
            outcome: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut runs = self.runs.lock().await;
        runs.insert(
            run.id,
            RunEntry {
                run: run.clone(),
                steps: Vec::new(),
                sleeps: Vec::new(),
            },
        );
        Ok(run)
    }

    async fn get_run(&self, run_id: RunId) -> BackendResult<Option<WorkflowRun>> {
        let runs = self.runs.lock().await;
        Ok(runs.get(&run_id).map(|entry| entry.run.clone()))
    }

    async fn claim_due_runs(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> BackendResult<Vec<WorkflowRun>> {
        let mut runs = self.runs.lock().await;

        let mut due: Vec<&mut RunEntry> = runs
            .values_mut()
            .filter(|entry| is_due(entry, now))
            .collect();
        due.sort_by_key(|entry| (entry.run.wake_at, entry.run.created_at));

        let deadline = lease_deadline(now, lease);
        let claimed = due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.run.status = RunStatus::Running;
                entry.run.updated_at = now;
                entry.run.lease_expires_at = Some(deadline);
                entry.run.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn finish_run(
        &self,
        run: &WorkflowRun,
        finish: RunFinish,
        now: DateTime<Utc>,
    ) -> BackendResult<WorkflowRun> {
        let mut runs = self.runs.lock().await;
        let entry = runs
            .get_mut(&run.id)
            .ok_or(BackendError::RunNotFound(run.id))?;

        let holds_lease = entry.run.status == RunStatus::Running
            && entry.run.lease_expires_at.is_some()
            && entry.run.lease_expires_at == run.lease_expires_at;
        if !holds_lease {
            return Err(BackendError::LeaseLost(run.id));
        }

        entry.run.status = finish.status();
        entry.run.updated_at = now;
        entry.run.lease_expires_at = None;
        match finish {
            RunFinish::Completed { outcome } | RunFinish::Aborted { outcome } => {
                entry.run.wake_at = None;
                entry.run.outcome = Some(outcome);
            }
            RunFinish::Sleeping { wake_at } => {
                entry.run.wake_at = Some(wake_at);
            }
            RunFinish::Retry { wake_at, error } => {
                entry.run.wake_at = Some(wake_at);
                entry.run.attempts += 1;
                entry.run.last_error = Some(error);
            }
            RunFinish::Failed { error } => {
                entry.run.wake_at = None;
                entry.run.last_error = Some(error);
            }
        }

        Ok(entry.run.clone())
    }

    async fn load_step(&self, run_id: RunId, label: &str) -> BackendResult<Option<StepRecord>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .get(&run_id)
            .and_then(|entry| entry.steps.iter().find(|step| step.label == label))
            .cloned())
    }

    async fn record_step(&self, run_id: RunId, record: StepRecord) -> BackendResult<StepRecord> {
        let mut runs = self.runs.lock().await;
        let entry = runs
            .get_mut(&run_id)
            .ok_or(BackendError::RunNotFound(run_id))?;

        if let Some(existing) = entry.steps.iter().find(|step| step.label == record.label) {
            return Ok(existing.clone());
        }
        entry.steps.push(record.clone());
        Ok(record)
    }

    async fn list_steps(&self, run_id: RunId) -> BackendResult<Vec<StepRecord>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .get(&run_id)
            .map(|entry| entry.steps.clone())
            .unwrap_or_default())
    }

    async fn load_sleep(&self, run_id: RunId, label: &str) -> BackendResult<Option<SleepRecord>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .get(&run_id)
            .and_then(|entry| entry.sleeps.iter().find(|sleep| sleep.label == label))
            .cloned())
    }

    async fn record_sleep(
        &self,
        run_id: RunId,
        record: SleepRecord,
    ) -> BackendResult<SleepRecord> {
        let mut runs = self.runs.lock().await;
        let entry = runs
            .get_mut(&run_id)
            .ok_or(BackendError::RunNotFound(run_id))?;

        match entry
            .sleeps
            .iter_mut()
            .find(|sleep| sleep.label == record.label)
        {
            Some(existing) => {
                if existing.satisfied_at.is_none() {
                    existing.satisfied_at = record.satisfied_at;
                }
                Ok(existing.clone())
            }
            None => {
                entry.sleeps.push(record.clone());
                Ok(record)
            }
        }
    }

    async fn list_sleeps(&self, run_id: RunId) -> BackendResult<Vec<SleepRecord>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .get(&run_id)
            .map(|entry| entry.sleeps.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, hour, 0, 0).unwrap()
    }

    async fn claim_one(store: &MemoryRunStore, now: DateTime<Utc>) -> WorkflowRun {
        let mut claimed = store
            .claim_due_runs(now, Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        claimed.remove(0)
    }

    #[tokio::test]
    async fn test_claim_only_due_runs() {
        let store = MemoryRunStore::new();
        store.create_run("sub-later", at(20, 0)).await.unwrap();
        let later = claim_one(&store, at(20, 0)).await;
        store
            .finish_run(&later, RunFinish::Sleeping { wake_at: at(23, 0) }, at(20, 0))
            .await
            .unwrap();
        let due = store.create_run("sub-due", at(20, 0)).await.unwrap();

        let claimed = store
            .claim_due_runs(at(20, 1), Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].status, RunStatus::Running);

        // Leased runs are not handed out twice.
        let again = store
            .claim_due_runs(at(20, 1), Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryRunStore::new();
        let run = store.create_run("sub", at(20, 0)).await.unwrap();
        store
            .claim_due_runs(at(20, 0), Duration::from_secs(60), 10)
            .await
            .unwrap();

        let reclaimed = store
            .claim_due_runs(at(20, 1), Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, run.id);
    }

    #[tokio::test]
    async fn test_first_step_record_wins() {
        let store = MemoryRunStore::new();
        let run = store.create_run("sub", at(20, 0)).await.unwrap();

        let first = StepRecord {
            label: "get subscription".to_string(),
            output: serde_json::json!({"n": 1}),
            recorded_at: at(20, 0),
        };
        let second = StepRecord {
            output: serde_json::json!({"n": 2}),
            ..first.clone()
        };

        store.record_step(run.id, first.clone()).await.unwrap();
        let stored = store.record_step(run.id, second).await.unwrap();
        assert_eq!(stored, first);
        assert_eq!(store.list_steps(run.id).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_sleep_until_is_fixed_by_first_record() {
        let store = MemoryRunStore::new();
        let run = store.create_run("sub", at(20, 0)).await.unwrap();

        let pending = SleepRecord {
            label: "Reminder 7 days before".to_string(),
            until: at(23, 0),
            satisfied_at: None,
        };
        store.record_sleep(run.id, pending).await.unwrap();

        let stored = store
            .record_sleep(
                run.id,
                SleepRecord {
                    label: "Reminder 7 days before".to_string(),
                    until: at(25, 0),
                    satisfied_at: Some(at(23, 1)),
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.until, at(23, 0));
        assert_eq!(stored.satisfied_at, Some(at(23, 1)));
    }

    #[tokio::test]
    async fn test_retry_finish_increments_attempts() {
        let store = MemoryRunStore::new();
        store.create_run("sub", at(20, 0)).await.unwrap();
        let run = claim_one(&store, at(20, 0)).await;

        let updated = store
            .finish_run(
                &run,
                RunFinish::Retry {
                    wake_at: at(20, 1),
                    error: "store unavailable".to_string(),
                },
                at(20, 0),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Queued);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.last_error.as_deref(), Some("store unavailable"));
        assert!(updated.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_finish_requires_current_lease() {
        let store = MemoryRunStore::new();
        let created = store.create_run("sub", at(20, 0)).await.unwrap();

        // Never claimed.
        let err = store
            .finish_run(&created, RunFinish::Sleeping { wake_at: at(23, 0) }, at(20, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::LeaseLost(id) if id == created.id));

        let stale = claim_one(&store, at(20, 0)).await;
        let current = claim_one(&store, at(20, 1)).await;
        assert_ne!(stale.lease_expires_at, current.lease_expires_at);

        let done = store
            .finish_run(
                &current,
                RunFinish::Completed {
                    outcome: serde_json::json!({"outcome": "completed"}),
                },
                at(20, 1),
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        let err = store
            .finish_run(&stale, RunFinish::Sleeping { wake_at: at(23, 0) }, at(20, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::LeaseLost(_)));
        let run = store.get_run(created.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.wake_at.is_none());
    }
}
