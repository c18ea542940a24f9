use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// External mutual-exclusion service used to own a namespace.
///
/// Implementations must make `set_if_absent` atomic: of several concurrent
/// callers racing for the same free key, exactly one gets `true`.
#[async_trait]
pub trait NamespaceLock: Send + Sync {
    /// Set `key` to `value` with a time-to-live, unless a live entry exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Push the expiry of a live entry holding `value` to `ttl` from now.
    /// Returns `false` when the entry expired, is missing, or belongs to
    /// someone else.
    async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it still holds `value`. Returns whether anything was removed.
    async fn delete(&self, key: &str, value: &str) -> Result<bool>;
}

/// In-process lock service with TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryNamespaceLock {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryNamespaceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if the entry has not expired.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }
}

#[async_trait]
impl NamespaceLock for MemoryNamespaceLock {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((holder, expires)) if holder == value && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((holder, _)) if holder == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
