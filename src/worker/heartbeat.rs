use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CronConfig;
use crate::document::{Job, WaitState};
use crate::error::{CronError, Result};
use crate::namespace::{
    Acquisition, NamespaceCandidates, NamespaceDedication, NamespaceLock, StoreNamespaceCandidates,
};
use crate::scheduler::{
    ClaimProtocol, ClaimedJob, NamespaceScope, RecurrenceEvaluator, ReschedulePolicy,
    ScheduleCalculator,
};
use crate::store::JobStore;
use crate::worker::hooks::{CronHandler, HookResult};
use crate::worker::stats::{JobStatistics, StatisticsSink};

/// How often a graceful stop checks whether the in-flight job has finished.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Snapshot of a worker's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub running: bool,
    /// A tick is between claiming and rescheduling.
    pub processing: bool,
    /// The last claim attempt came back empty.
    pub idle: bool,
}

enum Tick {
    Processed,
    Idle,
}

/// Assembles a [`CronWorker`].
pub struct CronWorkerBuilder {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn CronHandler>,
    config: CronConfig,
    lock: Option<Arc<dyn NamespaceLock>>,
    candidates: Option<Arc<dyn NamespaceCandidates>>,
    evaluator: Option<Arc<dyn RecurrenceEvaluator>>,
    statistics: Option<Arc<dyn StatisticsSink>>,
}

impl CronWorkerBuilder {
    pub fn config(mut self, config: CronConfig) -> Self {
        self.config = config;
        self
    }

    /// Required when namespace dedication is enabled.
    pub fn namespace_lock(mut self, lock: Arc<dyn NamespaceLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Replace the default store-backed namespace discovery.
    pub fn namespace_candidates(mut self, candidates: Arc<dyn NamespaceCandidates>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn RecurrenceEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn statistics(mut self, sink: Arc<dyn StatisticsSink>) -> Self {
        self.statistics = Some(sink);
        self
    }

    pub fn build(self) -> Result<CronWorker> {
        let config = self.config;
        config.validate()?;

        let dedication = match (config.namespaces.dedication, self.lock) {
            (true, None) => {
                return Err(CronError::Config(
                    "namespace dedication requires a namespace lock service".to_string(),
                ))
            }
            (true, Some(lock)) => {
                let candidates = self.candidates.unwrap_or_else(|| {
                    Arc::new(StoreNamespaceCandidates::new(
                        self.store.clone(),
                        config.fields.clone(),
                        config.condition.clone(),
                    ))
                });
                Some(NamespaceDedication::new(
                    lock,
                    candidates,
                    config.namespaces.clone(),
                    config.lock_duration,
                ))
            }
            (false, _) => None,
        };

        let calculator = match self.evaluator {
            Some(evaluator) => ScheduleCalculator::new(evaluator),
            None => ScheduleCalculator::default(),
        };
        let claim = ClaimProtocol::new(
            self.store.clone(),
            config.fields.clone(),
            config.lock_duration,
            config.condition.clone(),
        );
        let reschedule = ReschedulePolicy::new(
            self.store,
            config.fields.clone(),
            calculator,
            config.reprocess_delay,
        );

        let ns = &config.namespaces;
        let default_scope = if ns.watched.is_none() && ns.include_unnamespaced {
            None
        } else {
            Some(NamespaceScope::Watched {
                namespaces: ns.watched.clone(),
                include_unnamespaced: ns.include_unnamespaced,
            })
        };

        let (status, _) = watch::channel(WorkerStatus::default());
        Ok(CronWorker {
            engine: Arc::new(Engine {
                config,
                handler: self.handler,
                claim,
                reschedule,
                dedication: Mutex::new(dedication),
                default_scope,
                statistics: self.statistics,
                status,
            }),
            control: Mutex::new(None),
        })
    }
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls a [`JobStore`] for eligible jobs and hands them to a [`CronHandler`],
/// one job at a time.
///
/// Run several workers (in one process or many) against the same store to
/// process jobs concurrently; the store's atomic claim keeps them apart.
pub struct CronWorker {
    engine: Arc<Engine>,
    control: Mutex<Option<Running>>,
}

impl CronWorker {
    pub fn builder(store: Arc<dyn JobStore>, handler: Arc<dyn CronHandler>) -> CronWorkerBuilder {
        CronWorkerBuilder {
            store,
            handler,
            config: CronConfig::default(),
            lock: None,
            candidates: None,
            evaluator: None,
            statistics: None,
        }
    }

    /// Start the loop. Does nothing if it is already running.
    pub async fn start(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            return Ok(());
        }

        self.engine.update(|s| {
            s.running = true;
            s.idle = false;
        });
        if let Err(e) = self.engine.hook(|h| async move { h.on_start().await }).await {
            self.engine.report(e).await;
        }

        let token = CancellationToken::new();
        let engine = self.engine.clone();
        let loop_token = token.clone();
        let task = tokio::spawn(async move { engine.run(loop_token).await });
        *control = Some(Running { token, task });

        tracing::info!(cron_name = %self.engine.config.cron_name, "Worker started");
        Ok(())
    }

    /// Stop the loop.
    ///
    /// Unless `force` is set, waits for the job in flight to be handled and
    /// rescheduled before calling the stop hook. A forced stop leaves that job
    /// to finish on its own; if it never does, its lock lapses.
    pub async fn stop(&self, force: bool) -> Result<()> {
        let mut control = self.control.lock().await;
        let Some(running) = control.take() else {
            return Ok(());
        };

        self.engine.update(|s| s.running = false);
        running.token.cancel();

        if !force {
            while self.is_processing() {
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
            if let Err(e) = running.task.await {
                tracing::warn!(error = %e, "Worker loop ended abnormally");
            }
        }

        if let Err(e) = self.engine.hook(|h| async move { h.on_stop().await }).await {
            self.engine.report(e).await;
        }
        tracing::info!(cron_name = %self.engine.config.cron_name, force, "Worker stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.status().running
    }

    pub fn is_processing(&self) -> bool {
        self.status().processing
    }

    pub fn is_idle(&self) -> bool {
        self.status().idle
    }

    pub fn status(&self) -> WorkerStatus {
        *self.engine.status.borrow()
    }

    /// Receives every status change.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.engine.status.subscribe()
    }

    /// Namespace currently owned through dedication.
    pub async fn owned_namespace(&self) -> Option<String> {
        let dedication = self.engine.dedication.lock().await;
        dedication.as_ref().and_then(|d| d.owned().map(str::to_string))
    }
}

/// Everything the loop task needs.
struct Engine {
    config: CronConfig,
    handler: Arc<dyn CronHandler>,
    claim: ClaimProtocol,
    reschedule: ReschedulePolicy,
    dedication: Mutex<Option<NamespaceDedication>>,
    default_scope: Option<NamespaceScope>,
    statistics: Option<Arc<dyn StatisticsSink>>,
    status: watch::Sender<WorkerStatus>,
}

impl Engine {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            if !pause(self.config.next_delay, &token).await {
                break;
            }

            let backoff = match self.tick().await {
                Ok(Tick::Processed) => false,
                Ok(Tick::Idle) => true,
                Err(e) => {
                    self.report(e).await;
                    true
                }
            };
            if backoff && !pause(self.config.idle_delay, &token).await {
                break;
            }
        }

        let released = match self.dedication.lock().await.as_mut() {
            Some(d) => d.release().await,
            None => Ok(()),
        };
        if let Err(e) = released {
            self.report(e).await;
        }
        tracing::debug!("Worker loop exited");
    }

    async fn tick(&self) -> Result<Tick> {
        self.update(|s| s.processing = true);
        let result = self.claim_and_process().await;
        self.update(|s| s.processing = false);

        match result? {
            Some(()) => {
                self.update(|s| s.idle = false);
                Ok(Tick::Processed)
            }
            None => {
                let was_idle = self.status.borrow().idle;
                self.update(|s| s.idle = true);
                if !was_idle {
                    tracing::debug!("No eligible jobs, going idle");
                    if let Err(e) = self.hook(|h| async move { h.on_idle().await }).await {
                        self.report(e).await;
                    }
                }
                Ok(Tick::Idle)
            }
        }
    }

    /// `Ok(None)` when there was nothing to claim.
    async fn claim_and_process(&self) -> Result<Option<()>> {
        let mut dedication = self.dedication.lock().await;
        let scope = match dedication.as_mut() {
            Some(d) => match d.acquire().await? {
                Acquisition::Acquired(ns) => Some(NamespaceScope::Only(ns)),
                Acquisition::Exhausted if self.config.namespaces.include_unnamespaced => {
                    Some(NamespaceScope::Unnamespaced)
                }
                Acquisition::Exhausted => return Ok(None),
                Acquisition::NotConfigured => self.default_scope.clone(),
            },
            None => self.default_scope.clone(),
        };

        let claimed = match self.claim.claim_next(None, scope.as_ref()).await? {
            Some(claimed) => claimed,
            None => {
                let Some(d) = dedication.as_mut() else {
                    return Ok(None);
                };
                let drained = d.owned().is_some();
                d.release().await?;
                if !(drained && self.config.namespaces.include_unnamespaced) {
                    return Ok(None);
                }
                // Unnamespaced jobs get a turn whenever a namespace drains.
                let unnamespaced = Some(&NamespaceScope::Unnamespaced);
                match self.claim.claim_next(None, unnamespaced).await? {
                    Some(claimed) => claimed,
                    None => return Ok(None),
                }
            }
        };
        drop(dedication);

        self.process(claimed).await?;
        Ok(Some(()))
    }

    async fn process(&self, claimed: ClaimedJob) -> Result<()> {
        let fields = self.claim.fields();
        let job_id = claimed.job.id;

        if self.config.reschedule_if_wait_until_null
            && fields.interval(&claimed.job.document).is_some()
            && fields.wait_state(&claimed.job.document) == WaitState::Ready
        {
            let effect = self.reschedule.reschedule(&claimed.job).await?;
            tracing::debug!(job_id = %job_id, effect = %effect, "Armed recurring job without running it");
            return Ok(());
        }

        let document = if self.config.return_original_document {
            claimed.job.document.clone()
        } else {
            claimed.with_lock(fields)
        };
        let job = Job::new(job_id, document);

        let started = Utc::now();
        let outcome = self
            .hook(move |h| async move { h.on_document(job).await })
            .await;
        let finished = Utc::now();

        if let Err(e) = outcome {
            tracing::warn!(job_id = %job_id, error = %e, "Job handler failed");
            self.report(e).await;
        }

        let effect = self.reschedule.reschedule(&claimed.job).await?;
        tracing::debug!(job_id = %job_id, effect = %effect, "Job processed");

        if let Some(sink) = &self.statistics {
            let stats = JobStatistics::new(
                job_id,
                claimed.job.document.clone(),
                started,
                finished,
                &self.config.server_name,
                &self.config.cron_name,
            );
            if let Err(e) = sink.record(stats).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to record job statistics");
            }
        }
        Ok(())
    }

    /// Run a hook on its own task so a panic cannot take the loop down.
    async fn hook<F, Fut>(&self, call: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn CronHandler>) -> Fut,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        match tokio::spawn(call(self.handler.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CronError::Handler(e)),
            Err(e) if e.is_panic() => Err(CronError::HandlerPanicked(panic_message(e.into_panic()))),
            Err(e) => Err(CronError::Internal(format!("hook task failed: {}", e))),
        }
    }

    /// Route an error to the error hook. Failures of the hook itself are only logged.
    async fn report(&self, error: CronError) {
        let handler = self.handler.clone();
        if let Err(e) = tokio::spawn(async move { handler.on_error(error).await }).await {
            tracing::error!(error = %e, "Error hook failed");
        }
    }

    fn update(&self, change: impl FnOnce(&mut WorkerStatus)) {
        self.status.send_modify(change);
    }
}

/// Sleep unless cancelled first. Returns false once the loop should exit.
async fn pause(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        tokio::task::yield_now().await;
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => !token.is_cancelled(),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
