//! The renewal reminder workflow.
//!
//! ```text
//! Start -> Fetching -> Validating -> Aborted
//!                                 \-> Scheduling -> Waiting <-> Firing -> Completed
//! ```
//!
//! [`ReminderWorkflow::run`] is written to be executed from the top on every
//! resume. All durable work goes through [`DurableContext`], and every label
//! it uses is derived from constants or reminder offsets, so each replay
//! walks the same label sequence and skips whatever is already recorded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dispatch::{DispatchReceipt, ReminderDispatcher};
use crate::schedule::{self, MissedReminderPolicy, ReminderOffsets};
use crate::subscription::{Subscription, SubscriptionLookup, SubscriptionStatus};
use crate::substrate::{DurableContext, Interrupt, StepError};

/// Step label of the subscription lookup.
pub const GET_SUBSCRIPTION_STEP: &str = "get subscription";

/// Step label that pins the instant the schedule is evaluated against.
pub const EVALUATE_SCHEDULE_STEP: &str = "evaluate schedule";

/// Position of a run in the state machine, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Start,
    Fetching,
    Validating,
    Scheduling,
    Waiting,
    Firing,
    Completed,
    Aborted,
}

/// Why a run ended without sending reminders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    NotFound,
    Inactive {
        status: SubscriptionStatus,
    },
    RenewalLapsed {
        renewal_date: DateTime<Utc>,
        evaluated_at: DateTime<Utc>,
    },
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed {
        /// Labels dispatched, in order.
        dispatched: Vec<String>,
        /// Labels dropped by [`MissedReminderPolicy::Skip`].
        skipped: Vec<String>,
    },
    Aborted(AbortReason),
}

impl WorkflowOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Settings that shape every run's schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReminderSettings {
    pub offsets: ReminderOffsets,
    pub missed_policy: MissedReminderPolicy,
}

/// Renewal reminder state machine bound to its collaborators.
#[derive(Clone)]
pub struct ReminderWorkflow {
    lookup: Arc<dyn SubscriptionLookup>,
    dispatcher: Arc<dyn ReminderDispatcher>,
    settings: ReminderSettings,
}

impl ReminderWorkflow {
    pub fn new(
        lookup: Arc<dyn SubscriptionLookup>,
        dispatcher: Arc<dyn ReminderDispatcher>,
        settings: ReminderSettings,
    ) -> Self {
        Self {
            lookup,
            dispatcher,
            settings,
        }
    }

    /// Execute (or replay) the workflow for one subscription.
    ///
    /// Returns `Err(Interrupt::Suspended)` when the run must wait for a
    /// future reminder; the caller parks the run and replays it later.
    pub async fn run(
        &self,
        ctx: &mut DurableContext,
        subscription_id: &str,
    ) -> Result<WorkflowOutcome, Interrupt> {
        let run_id = ctx.run_id();
        debug!(%run_id, subscription_id, state = ?WorkflowState::Start, "replaying reminder run");

        debug!(%run_id, state = ?WorkflowState::Fetching, "fetching subscription");
        let lookup = self.lookup.as_ref();
        let subscription: Option<Subscription> = ctx
            .step(GET_SUBSCRIPTION_STEP, move || async move {
                lookup
                    .find_by_id(subscription_id)
                    .await
                    .map_err(StepError::from)
            })
            .await?;

        debug!(%run_id, state = ?WorkflowState::Validating, "validating subscription");
        let Some(subscription) = subscription else {
            info!(%run_id, subscription_id, "subscription not found; stopping workflow");
            return Ok(abort(AbortReason::NotFound));
        };
        if !subscription.is_active() {
            info!(
                %run_id,
                subscription_id,
                status = %subscription.status,
                "subscription is not active; stopping workflow"
            );
            return Ok(abort(AbortReason::Inactive {
                status: subscription.status,
            }));
        }

        let clock_now = ctx.now();
        let evaluated_at: DateTime<Utc> = ctx
            .step(EVALUATE_SCHEDULE_STEP, move || async move {
                Ok(clock_now)
            })
            .await?;

        if subscription.renewal_date <= evaluated_at {
            info!(
                %run_id,
                subscription_id,
                renewal_date = %subscription.renewal_date,
                "renewal date has passed; stopping workflow"
            );
            return Ok(abort(AbortReason::RenewalLapsed {
                renewal_date: subscription.renewal_date,
                evaluated_at,
            }));
        }

        debug!(%run_id, state = ?WorkflowState::Scheduling, offsets = %self.settings.offsets, "computing schedule");
        let events = schedule::compute(
            subscription.renewal_date,
            &self.settings.offsets,
            evaluated_at,
        )
        .map_err(|err| Interrupt::StepFailed {
            label: EVALUATE_SCHEDULE_STEP.to_string(),
            source: StepError::fatal(err.to_string()),
        })?;

        let dispatcher = self.dispatcher.as_ref();
        let subscription = &subscription;
        let mut dispatched = Vec::with_capacity(events.len());
        let mut skipped = Vec::new();

        for event in &events {
            if event.already_due {
                if self.settings.missed_policy == MissedReminderPolicy::Skip {
                    info!(%run_id, label = %event.label, fires_at = %event.fires_at, "skipping missed reminder");
                    skipped.push(event.label.clone());
                    continue;
                }
                debug!(%run_id, label = %event.label, "reminder already due; firing without sleep");
            } else {
                debug!(%run_id, label = %event.label, state = ?WorkflowState::Waiting, "waiting for reminder");
                ctx.sleep_until(&event.label, event.fires_at).await?;
            }

            debug!(%run_id, label = %event.label, state = ?WorkflowState::Firing, "firing reminder");
            let label = event.label.as_str();
            let receipt: DispatchReceipt = ctx
                .step(label, move || async move {
                    dispatcher
                        .send(label, subscription)
                        .await
                        .map_err(StepError::from)
                })
                .await?;
            debug!(%run_id, label, recipient = %receipt.recipient, "reminder recorded");
            dispatched.push(event.label.clone());
        }

        info!(
            %run_id,
            subscription_id,
            state = ?WorkflowState::Completed,
            dispatched = dispatched.len(),
            skipped = skipped.len(),
            "reminder workflow completed"
        );
        Ok(WorkflowOutcome::Completed {
            dispatched,
            skipped,
        })
    }
}

fn abort(reason: AbortReason) -> WorkflowOutcome {
    debug!(state = ?WorkflowState::Aborted, ?reason, "workflow aborted");
    WorkflowOutcome::Aborted(reason)
}
