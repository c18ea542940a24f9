use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::document::{encode_timestamp, FieldPaths, Job, WaitState};
use crate::error::Result;
use crate::scheduler::ScheduleCalculator;
use crate::store::{JobStore, Update};

/// What happened to a job after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleEffect {
    /// No further occurrence and `autoRemove` set.
    Deleted,
    /// No further occurrence; the job is kept but will not be claimed again.
    Disabled,
    /// Armed again for the given instant.
    Rearmed(DateTime<Utc>),
}

impl fmt::Display for RescheduleEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescheduleEffect::Deleted => write!(f, "deleted"),
            RescheduleEffect::Disabled => write!(f, "disabled"),
            RescheduleEffect::Rearmed(at) => write!(f, "rearmed for {}", at.to_rfc3339()),
        }
    }
}

/// Decides and applies the post-run state of a claimed job.
///
/// Recurring jobs are anchored on `max(waitUntil, now)`: after a long outage
/// a job runs once and resumes its cadence instead of replaying every missed
/// occurrence.
#[derive(Clone)]
pub struct ReschedulePolicy {
    store: Arc<dyn JobStore>,
    fields: FieldPaths,
    calculator: ScheduleCalculator,
    reprocess_delay: Duration,
}

impl ReschedulePolicy {
    pub fn new(
        store: Arc<dyn JobStore>,
        fields: FieldPaths,
        calculator: ScheduleCalculator,
        reprocess_delay: Duration,
    ) -> Self {
        Self {
            store,
            fields,
            calculator,
            reprocess_delay,
        }
    }

    /// Pure decision for `job` at `now`; touches nothing.
    pub fn plan(&self, job: &Job, now: DateTime<Utc>) -> RescheduleEffect {
        let doc = &job.document;
        let reference = match self.fields.wait_state(doc) {
            WaitState::At(due) if due > now => due,
            _ => now,
        };
        let next = self.calculator.next_run(
            reference,
            self.fields.interval(doc),
            self.fields.repeat_until(doc),
            self.reprocess_delay,
        );

        match next {
            Some(at) => RescheduleEffect::Rearmed(at),
            None if self.fields.auto_remove(doc) => RescheduleEffect::Deleted,
            None => RescheduleEffect::Disabled,
        }
    }

    /// Plan and write the outcome for `job`.
    pub async fn reschedule(&self, job: &Job) -> Result<RescheduleEffect> {
        let effect = self.plan(job, Utc::now());
        let applied = match effect {
            RescheduleEffect::Deleted => self.store.delete_one(&job.id).await?,
            RescheduleEffect::Disabled => {
                let update = Update::new()
                    .unset(self.fields.wait_until.as_str())
                    .unset(self.fields.lock_until.as_str());
                self.store.update_one(&job.id, &update).await?
            }
            RescheduleEffect::Rearmed(at) => {
                let update = Update::new()
                    .unset(self.fields.lock_until.as_str())
                    .set(self.fields.wait_until.as_str(), encode_timestamp(at));
                self.store.update_one(&job.id, &update).await?
            }
        };

        if applied {
            tracing::debug!(job_id = %job.id, effect = %effect, "Rescheduled job");
        } else {
            tracing::debug!(job_id = %job.id, effect = %effect, "Job vanished before reschedule");
        }
        Ok(effect)
    }
}
