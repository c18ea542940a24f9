use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;

use crate::document::FieldPaths;
use crate::error::Result;
use crate::scheduler::{eligibility_filter, NamespaceScope};
use crate::store::{Filter, JobStore};

/// Source of namespaces worth trying to own, best first.
#[async_trait]
pub trait NamespaceCandidates: Send + Sync {
    async fn candidates(&self, watched: Option<&[String]>) -> Result<Vec<String>>;
}

/// Namespaces that currently hold at least one eligible job.
///
/// Ordered by the most recent lock expiry seen in each namespace, oldest
/// first, so namespaces nobody has touched for a while are served before
/// busy ones. Namespaces with equal expiry are shuffled to spread workers.
pub struct StoreNamespaceCandidates {
    store: Arc<dyn JobStore>,
    fields: FieldPaths,
    condition: Option<Filter>,
}

impl StoreNamespaceCandidates {
    pub fn new(store: Arc<dyn JobStore>, fields: FieldPaths, condition: Option<Filter>) -> Self {
        Self {
            store,
            fields,
            condition,
        }
    }
}

#[async_trait]
impl NamespaceCandidates for StoreNamespaceCandidates {
    async fn candidates(&self, watched: Option<&[String]>) -> Result<Vec<String>> {
        let scope = NamespaceScope::Watched {
            namespaces: watched.map(<[String]>::to_vec),
            include_unnamespaced: false,
        };
        let mut parts = vec![
            eligibility_filter(&self.fields, Utc::now()),
            scope.to_filter(&self.fields),
        ];
        parts.extend(self.condition.iter().cloned());

        let groups = self
            .store
            .group_max(
                &Filter::And(parts),
                &self.fields.namespace,
                &self.fields.lock_until,
            )
            .await?;

        let mut rng = rand::thread_rng();
        let mut ordered = Vec::with_capacity(groups.len());
        for tier in groups.chunk_by(|a, b| a.max == b.max) {
            let mut keys: Vec<String> = tier.iter().map(|g| g.key.clone()).collect();
            keys.shuffle(&mut rng);
            ordered.extend(keys);
        }
        Ok(ordered)
    }
}
