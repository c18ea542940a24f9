use async_trait::async_trait;

use crate::document::Job;
use crate::error::{BoxError, CronError};

pub type HookResult = std::result::Result<(), BoxError>;

/// User code driven by a [`CronWorker`](crate::worker::CronWorker).
///
/// Every hook runs on its own task: a hook that panics is reported through
/// [`on_error`](CronHandler::on_error) and the worker keeps going.
#[async_trait]
pub trait CronHandler: Send + Sync + 'static {
    /// Handle one claimed job. The job is rescheduled whether or not this
    /// returns an error.
    async fn on_document(&self, job: Job) -> HookResult;

    async fn on_start(&self) -> HookResult {
        Ok(())
    }

    async fn on_stop(&self) -> HookResult {
        Ok(())
    }

    /// Called when a tick finds nothing to do after one that did.
    async fn on_idle(&self) -> HookResult {
        Ok(())
    }

    /// Receives every error caught by the worker loop.
    async fn on_error(&self, error: CronError) {
        tracing::error!(error = %error, "Worker tick failed");
    }
}
