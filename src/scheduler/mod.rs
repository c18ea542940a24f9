//! Claim and reschedule protocol against a [`JobStore`](crate::store::JobStore).
//!
//! # Components
//!
//! - [`ScheduleCalculator`]: next run time of a recurring job, or expiry
//! - [`ClaimProtocol`]: atomically locks the next eligible job
//! - [`ReschedulePolicy`]: deletes, disables or re-arms a job after it ran
//!
//! # Job lifecycle
//!
//! 1. A producer inserts a document with `waitUntil` set (`null` = now)
//! 2. A worker claims it: `lockUntil = now + lock_duration`
//! 3. The handler runs
//! 4. The job is rescheduled, whatever the handler returned
//!
//! A worker that dies between 2 and 4 leaves the lock behind; the job becomes
//! eligible again once `lockUntil` has passed.

pub mod claim;
pub mod reschedule;
pub mod schedule;

pub use claim::{eligibility_filter, ClaimProtocol, ClaimedJob, NamespaceScope};
pub use reschedule::{RescheduleEffect, ReschedulePolicy};
pub use schedule::{CronEvaluator, RecurrenceEvaluator, ScheduleCalculator};
