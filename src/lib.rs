pub mod config;
pub mod document;
pub mod error;
pub mod namespace;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use config::{CronConfig, NamespaceConfig};
pub use document::{FieldPaths, Job, JobId, NewJob, WaitState};
pub use error::{BoxError, CronError, Result};
pub use store::{Filter, JobStore, MemoryJobStore, SqliteJobStore};
pub use worker::{CronHandler, CronWorker, WorkerStatus};
