use std::time::Duration;

use crate::error::{CronError, Result};
use crate::store::Filter;

pub use crate::document::FieldPaths;

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(600);

/// Which namespaces a worker serves and whether it dedicates itself to one
/// at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Namespaces this worker may take jobs from. `None` means all of them.
    pub watched: Option<Vec<String>>,
    /// Also take jobs that carry no namespace.
    ///
    /// Under dedication these are claimed when every namespace is owned
    /// elsewhere, and once each time an owned namespace runs dry. A namespace
    /// that never runs dry keeps its worker, so unnamespaced jobs then wait
    /// for another worker.
    pub include_unnamespaced: bool,
    /// Own a single namespace at a time through the lock service.
    pub dedication: bool,
    /// Lock entries are keyed `"{lock_prefix}:{namespace}"`.
    pub lock_prefix: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            watched: None,
            include_unnamespaced: true,
            dedication: false,
            lock_prefix: "cron-lite:namespace".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronConfig {
    /// Pause before every tick.
    pub next_delay: Duration,
    /// Minimum gap between a run and the next occurrence of a recurring job.
    pub reprocess_delay: Duration,
    /// Extra pause after a tick that found nothing to do.
    pub idle_delay: Duration,
    /// How long a claim holds a job before another worker may take it.
    pub lock_duration: Duration,
    pub fields: FieldPaths,
    /// Merged into every claim.
    pub condition: Option<Filter>,
    pub namespaces: NamespaceConfig,
    /// Re-arm freshly claimed recurring jobs whose `waitUntil` is `null`
    /// without running them.
    pub reschedule_if_wait_until_null: bool,
    /// Hand the handler the document exactly as claimed, without the lock
    /// expiry written into it.
    pub return_original_document: bool,
    pub cron_name: String,
    pub server_name: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            next_delay: Duration::ZERO,
            reprocess_delay: Duration::ZERO,
            idle_delay: Duration::ZERO,
            lock_duration: DEFAULT_LOCK_DURATION,
            fields: FieldPaths::default(),
            condition: None,
            namespaces: NamespaceConfig::default(),
            reschedule_if_wait_until_null: false,
            return_original_document: false,
            cron_name: "cron-lite".to_string(),
            server_name: local_hostname(),
        }
    }
}

impl CronConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next_delay(mut self, delay: Duration) -> Self {
        self.next_delay = delay;
        self
    }

    pub fn with_reprocess_delay(mut self, delay: Duration) -> Self {
        self.reprocess_delay = delay;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_fields(mut self, fields: FieldPaths) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_condition(mut self, condition: Filter) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_watched_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces.watched = Some(namespaces.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_unnamespaced(mut self, include: bool) -> Self {
        self.namespaces.include_unnamespaced = include;
        self
    }

    pub fn with_namespace_dedication(mut self, enabled: bool) -> Self {
        self.namespaces.dedication = enabled;
        self
    }

    pub fn with_reschedule_if_wait_until_null(mut self, enabled: bool) -> Self {
        self.reschedule_if_wait_until_null = enabled;
        self
    }

    pub fn with_return_original_document(mut self, enabled: bool) -> Self {
        self.return_original_document = enabled;
        self
    }

    pub fn with_cron_name(mut self, name: impl Into<String>) -> Self {
        self.cron_name = name.into();
        self
    }

    /// Reject configurations that cannot work at all.
    pub fn validate(&self) -> Result<()> {
        self.fields.validate()?;
        if self.lock_duration.is_zero() {
            return Err(CronError::Config(
                "lock duration must be greater than zero".to_string(),
            ));
        }
        let ns = &self.namespaces;
        if ns.watched.as_ref().is_some_and(|w| w.is_empty()) && !ns.include_unnamespaced {
            return Err(CronError::Config(
                "empty watch list with unnamespaced jobs excluded leaves nothing to process"
                    .to_string(),
            ));
        }
        if ns.dedication && ns.lock_prefix.is_empty() {
            return Err(CronError::Config(
                "namespace lock prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
