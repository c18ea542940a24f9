use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::NamespaceConfig;
use crate::error::{CronError, Result};
use crate::namespace::{NamespaceCandidates, NamespaceLock};

/// Outcome of [`NamespaceDedication::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// This worker owns the namespace (freshly or from an earlier tick).
    Acquired(String),
    /// Every candidate is owned by someone else, or there are none.
    Exhausted,
    /// Dedication is switched off; claims are not namespace-bound.
    NotConfigured,
}

/// Exclusive ownership of one namespace at a time, mediated by a
/// [`NamespaceLock`].
///
/// Only the worker loop touches this, so the owned namespace is plain state.
/// Ownership is only trusted for half the lock TTL after it was last
/// written; past that it is renewed through [`NamespaceLock::extend`].
pub struct NamespaceDedication {
    lock: Arc<dyn NamespaceLock>,
    candidates: Arc<dyn NamespaceCandidates>,
    config: NamespaceConfig,
    ttl: Duration,
    marker: String,
    owned: Option<(String, Instant)>,
}

impl NamespaceDedication {
    pub fn new(
        lock: Arc<dyn NamespaceLock>,
        candidates: Arc<dyn NamespaceCandidates>,
        config: NamespaceConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            lock,
            candidates,
            config,
            ttl,
            marker: Uuid::new_v4().to_string(),
            owned: None,
        }
    }

    pub fn owned(&self) -> Option<&str> {
        self.owned.as_ref().map(|(ns, _)| ns.as_str())
    }

    /// Value this worker writes into lock entries.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn lock_key(&self, namespace: &str) -> String {
        format!("{}:{}", self.config.lock_prefix, namespace)
    }

    /// Keep the owned namespace, or try to lock the first free candidate.
    pub async fn acquire(&mut self) -> Result<Acquisition> {
        if !self.config.dedication {
            return Ok(Acquisition::NotConfigured);
        }
        if let Some(ns) = self.renew().await? {
            return Ok(Acquisition::Acquired(ns));
        }

        let candidates = self
            .candidates
            .candidates(self.config.watched.as_deref())
            .await?;
        for ns in candidates {
            let key = self.lock_key(&ns);
            let attempted = Instant::now();
            let won = self
                .lock
                .set_if_absent(&key, &self.marker, self.ttl)
                .await
                .map_err(lock_service_error)?;
            if won {
                tracing::info!(namespace = %ns, "Acquired namespace");
                self.owned = Some((ns.clone(), attempted));
                return Ok(Acquisition::Acquired(ns));
            }
            tracing::debug!(namespace = %ns, "Namespace owned by another worker");
        }
        Ok(Acquisition::Exhausted)
    }

    /// The owned namespace if it is still ours, extending the lock entry once
    /// half its TTL has passed. An entry that lapsed or changed hands ends
    /// ownership.
    async fn renew(&mut self) -> Result<Option<String>> {
        let Some((ns, written)) = self.owned.take() else {
            return Ok(None);
        };
        if written.elapsed() < self.ttl / 2 {
            self.owned = Some((ns.clone(), written));
            return Ok(Some(ns));
        }

        let key = self.lock_key(&ns);
        let renewed_at = Instant::now();
        let kept = self
            .lock
            .extend(&key, &self.marker, self.ttl)
            .await
            .map_err(lock_service_error)?;
        if kept {
            tracing::debug!(namespace = %ns, "Renewed namespace");
            self.owned = Some((ns.clone(), renewed_at));
            Ok(Some(ns))
        } else {
            tracing::warn!(namespace = %ns, "Namespace lock expired or taken over; ownership lost");
            Ok(None)
        }
    }

    /// Give up the owned namespace. Ownership is dropped locally even when the
    /// lock service fails; the entry then lapses with its TTL.
    pub async fn release(&mut self) -> Result<()> {
        let Some((ns, _)) = self.owned.take() else {
            return Ok(());
        };
        let key = self.lock_key(&ns);
        match self.lock.delete(&key, &self.marker).await {
            Ok(true) => {
                tracing::info!(namespace = %ns, "Released namespace");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(namespace = %ns, "Namespace lock already expired or taken over");
                Ok(())
            }
            Err(e) => Err(lock_service_error(e)),
        }
    }
}

fn lock_service_error(e: CronError) -> CronError {
    match e {
        CronError::LockService(_) => e,
        other => CronError::LockService(other.to_string()),
    }
}
