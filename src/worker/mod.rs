//! The worker loop that turns a job store into a job queue.
//!
//! # Components
//!
//! - [`CronWorker`]: start/stop lifecycle and the polling loop
//! - [`CronHandler`]: user hooks (`on_document`, `on_start`, `on_stop`,
//!   `on_idle`, `on_error`)
//! - [`StatisticsSink`]: optional per-job timing records
//!
//! # Tick
//!
//! 1. Wait `next_delay` (exit if stopped meanwhile)
//! 2. With namespace dedication, own a namespace or fall back to
//!    unnamespaced jobs
//! 3. Claim one job; on a miss go idle, release the namespace and wait
//!    `idle_delay`
//! 4. Run `on_document`, then reschedule the job regardless of the outcome
//!
//! Errors from any step go to `on_error` and the loop carries on.

pub mod heartbeat;
pub mod hooks;
pub mod stats;

pub use heartbeat::{CronWorker, CronWorkerBuilder, WorkerStatus};
pub use hooks::{CronHandler, HookResult};
pub use stats::{JobStatistics, MemoryStatistics, StatisticsSink};
