use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::document::{get_path, Job, JobId};
use crate::error::Result;
use crate::store::query::{sort_key_cmp, Filter, GroupMax, Sort, Update};
use crate::store::JobStore;

/// In-process job store.
///
/// The whole map sits behind one mutex, held across match and update, which
/// is what makes [`JobStore::find_one_and_update`] atomic.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, Value>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current number of documents
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, document: Value) -> Result<JobId> {
        let id = JobId::new();
        self.jobs.lock().await.insert(id, document);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(id).map(|doc| Job::new(*id, doc.clone())))
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(id, doc)| Job::new(*id, doc.clone()))
            .collect())
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.values().filter(|doc| filter.matches(doc)).count())
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: Option<&Sort>,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;

        // BTreeMap iteration is already in id order, and min_by keeps the
        // first of equal elements, so ties fall back to the smallest id.
        let mut candidates = jobs.iter().filter(|(_, doc)| filter.matches(doc));
        let chosen = match sort {
            Some(sort) => candidates.min_by(|(_, a), (_, b)| sort.compare(a, b)),
            None => candidates.next(),
        }
        .map(|(id, _)| *id);

        let Some(id) = chosen else {
            return Ok(None);
        };
        let Some(doc) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        let original = doc.clone();
        update.apply(doc);
        Ok(Some(Job::new(id, original)))
    }

    async fn update_one(&self, id: &JobId, update: &Update) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(doc) => {
                update.apply(doc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_one(&self, id: &JobId) -> Result<bool> {
        Ok(self.jobs.lock().await.remove(id).is_some())
    }

    async fn group_max(
        &self,
        filter: &Filter,
        group_path: &str,
        max_path: &str,
    ) -> Result<Vec<GroupMax>> {
        let jobs = self.jobs.lock().await;
        let mut groups: HashMap<String, Option<Value>> = HashMap::new();

        for doc in jobs.values().filter(|doc| filter.matches(doc)) {
            let Some(key) = get_path(doc, group_path).and_then(Value::as_str) else {
                continue;
            };
            let value = get_path(doc, max_path).filter(|v| !v.is_null()).cloned();
            let entry = groups.entry(key.to_string()).or_insert(None);
            if sort_key_cmp(value.as_ref(), entry.as_ref()) == std::cmp::Ordering::Greater {
                *entry = value;
            }
        }

        let mut result: Vec<GroupMax> = groups
            .into_iter()
            .map(|(key, max)| GroupMax { key, max })
            .collect();
        result.sort_by(|a, b| {
            sort_key_cmp(a.max.as_ref(), b.max.as_ref()).then_with(|| a.key.cmp(&b.key))
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn find_one_and_update_returns_pre_update_document() {
        let store = MemoryJobStore::new();
        let id = store.insert(json!({"waitUntil": null})).await.unwrap();

        let update = Update::new().set("lockUntil", "2030-01-01T00:00:00.000Z");
        let job = store
            .find_one_and_update(&Filter::exists("waitUntil"), &update, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.id, id);
        assert!(job.document.get("lockUntil").is_none());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(
            stored.document["lockUntil"],
            json!("2030-01-01T00:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn sorted_claim_prefers_earliest_value() {
        let store = MemoryJobStore::new();
        store
            .insert(json!({"waitUntil": "2026-01-02T00:00:00.000Z"}))
            .await
            .unwrap();
        let early = store
            .insert(json!({"waitUntil": "2026-01-01T00:00:00.000Z"}))
            .await
            .unwrap();

        let job = store
            .find_one_and_update(
                &Filter::exists("waitUntil"),
                &Update::new(),
                Some(&Sort::ascending("waitUntil")),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, early);
    }

    #[tokio::test]
    async fn group_max_orders_by_least_recent_lock() {
        let store = MemoryJobStore::new();
        for (ns, lock) in [
            ("a", json!("2026-01-03T00:00:00.000Z")),
            ("a", json!("2026-01-01T00:00:00.000Z")),
            ("b", json!("2026-01-02T00:00:00.000Z")),
        ] {
            store
                .insert(json!({"namespace": ns, "lockUntil": lock}))
                .await
                .unwrap();
        }
        store.insert(json!({"namespace": "c"})).await.unwrap();
        store.insert(json!({"lockUntil": "x"})).await.unwrap();

        let groups = store
            .group_max(&Filter::And(vec![]), "namespace", "lockUntil")
            .await
            .unwrap();
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
        assert_eq!(groups[2].max, Some(json!("2026-01-03T00:00:00.000Z")));
    }

    #[tokio::test]
    async fn update_and_delete_unknown_ids() {
        let store = MemoryJobStore::new();
        let missing = JobId::new();
        assert!(!store.update_one(&missing, &Update::new()).await.unwrap());
        assert!(!store.delete_one(&missing).await.unwrap());
        assert!(store.is_empty().await);
    }
}
