use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::document::{encode_timestamp, FieldPaths, Job};
use crate::error::{CronError, Result};
use crate::store::{Filter, JobStore, Sort, Update};

/// Restricts which namespaces a claim may draw from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Jobs of exactly this namespace.
    Only(String),
    /// Jobs with no namespace.
    Unnamespaced,
    /// Jobs in any listed namespace (any namespace at all when `namespaces`
    /// is `None`), optionally together with unnamespaced jobs.
    Watched {
        namespaces: Option<Vec<String>>,
        include_unnamespaced: bool,
    },
}

impl NamespaceScope {
    pub fn to_filter(&self, fields: &FieldPaths) -> Filter {
        let path = fields.namespace.as_str();
        let unnamespaced = || Filter::Or(vec![Filter::missing(path), Filter::is_null(path)]);
        match self {
            NamespaceScope::Only(ns) => Filter::eq(path, ns.as_str()),
            NamespaceScope::Unnamespaced => unnamespaced(),
            NamespaceScope::Watched {
                namespaces,
                include_unnamespaced,
            } => {
                let namespaced = match namespaces {
                    Some(list) => {
                        Filter::one_of(path, list.iter().map(|ns| Value::String(ns.clone())))
                    }
                    None => Filter::And(vec![
                        Filter::exists(path),
                        Filter::is_null(path).negate(),
                    ]),
                };
                if *include_unnamespaced {
                    Filter::Or(vec![namespaced, unnamespaced()])
                } else {
                    namespaced
                }
            }
        }
    }
}

/// A job won by [`ClaimProtocol::claim_next`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    /// The document as it was before the lock was written.
    pub job: Job,
    /// Lock expiry committed by the claim.
    pub locked_until: DateTime<Utc>,
}

impl ClaimedJob {
    /// The claimed document with the committed lock expiry filled in.
    pub fn with_lock(&self, fields: &FieldPaths) -> Value {
        let mut doc = self.job.document.clone();
        fields.set_lock_until(&mut doc, Some(self.locked_until));
        doc
    }
}

/// Documents that may be claimed at `now`: scheduled (`waitUntil` present),
/// due, and not held by a live lock. Timestamps are compared as instants, so
/// producers may write any RFC 3339 offset.
pub fn eligibility_filter(fields: &FieldPaths, now: DateTime<Utc>) -> Filter {
    Filter::And(vec![
        Filter::exists(fields.wait_until.as_str()),
        Filter::Or(vec![
            Filter::is_null(fields.wait_until.as_str()),
            Filter::at_or_before(fields.wait_until.as_str(), now),
        ]),
        Filter::Or(vec![
            Filter::missing(fields.lock_until.as_str()),
            Filter::is_null(fields.lock_until.as_str()),
            Filter::at_or_before(fields.lock_until.as_str(), now),
        ]),
    ])
}

/// Finds and locks the next eligible job with a single atomic store call.
#[derive(Clone)]
pub struct ClaimProtocol {
    store: Arc<dyn JobStore>,
    fields: FieldPaths,
    lock_duration: Duration,
    condition: Option<Filter>,
}

impl ClaimProtocol {
    pub fn new(
        store: Arc<dyn JobStore>,
        fields: FieldPaths,
        lock_duration: Duration,
        condition: Option<Filter>,
    ) -> Self {
        Self {
            store,
            fields,
            lock_duration,
            condition,
        }
    }

    pub fn fields(&self) -> &FieldPaths {
        &self.fields
    }

    /// The full claim filter at `now`, including the configured condition.
    pub fn filter(
        &self,
        now: DateTime<Utc>,
        extra: Option<&Filter>,
        scope: Option<&NamespaceScope>,
    ) -> Filter {
        let mut parts = vec![eligibility_filter(&self.fields, now)];
        parts.extend(self.condition.iter().cloned());
        parts.extend(extra.cloned());
        parts.extend(scope.map(|s| s.to_filter(&self.fields)));
        Filter::And(parts)
    }

    /// Lock the eligible job with the earliest `waitUntil`.
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    pub async fn claim_next(
        &self,
        extra: Option<&Filter>,
        scope: Option<&NamespaceScope>,
    ) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let lock = chrono::Duration::from_std(self.lock_duration)
            .map_err(|e| CronError::Config(format!("lock duration out of range: {}", e)))?;
        let locked_until = now + lock;

        let filter = self.filter(now, extra, scope);
        let update = Update::new().set(self.fields.lock_until.as_str(), encode_timestamp(locked_until));
        let sort = Sort::ascending(self.fields.wait_until.as_str()).by_instant();

        let claimed = self
            .store
            .find_one_and_update(&filter, &update, Some(&sort))
            .await?;

        match claimed {
            Some(job) => {
                tracing::debug!(job_id = %job.id, locked_until = %locked_until, "Claimed job");
                Ok(Some(ClaimedJob { job, locked_until }))
            }
            None => {
                tracing::debug!(scope = ?scope, "No eligible job");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::WaitState;
    use serde_json::json;

    #[test]
    fn watched_scope_with_unnamespaced_jobs() {
        let fields = FieldPaths::default();
        let scope = NamespaceScope::Watched {
            namespaces: Some(vec!["a".to_string()]),
            include_unnamespaced: true,
        };
        let filter = scope.to_filter(&fields);

        assert!(filter.matches(&json!({"namespace": "a"})));
        assert!(filter.matches(&json!({})));
        assert!(filter.matches(&json!({"namespace": null})));
        assert!(!filter.matches(&json!({"namespace": "b"})));
    }

    #[test]
    fn any_namespace_scope_excludes_unnamespaced() {
        let fields = FieldPaths::default();
        let scope = NamespaceScope::Watched {
            namespaces: None,
            include_unnamespaced: false,
        };
        let filter = scope.to_filter(&fields);
        assert!(filter.matches(&json!({"namespace": "b"})));
        assert!(!filter.matches(&json!({"namespace": null})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn eligibility_requires_due_and_unlocked() {
        let fields = FieldPaths::default();
        let now = Utc::now();
        let filter = eligibility_filter(&fields, now);
        let past = encode_timestamp(now - chrono::Duration::seconds(1));
        let future = encode_timestamp(now + chrono::Duration::seconds(60));

        assert!(filter.matches(&json!({"waitUntil": null})));
        assert!(filter.matches(&json!({"waitUntil": past, "lockUntil": past})));
        assert!(!filter.matches(&json!({})));
        assert!(!filter.matches(&json!({"waitUntil": future})));
        assert!(!filter.matches(&json!({"waitUntil": null, "lockUntil": future})));
    }

    #[test]
    fn eligibility_reads_offsets_as_instants() {
        let fields = FieldPaths::default();
        let now = Utc::now();
        let filter = eligibility_filter(&fields, now);
        let east = chrono::FixedOffset::east_opt(5 * 3600).unwrap();
        let west = chrono::FixedOffset::west_opt(5 * 3600).unwrap();

        let overdue = (now - chrono::Duration::hours(1)).with_timezone(&east).to_rfc3339();
        let pending = (now + chrono::Duration::hours(1)).with_timezone(&west).to_rfc3339();
        let doc = json!({"waitUntil": overdue});
        assert!(filter.matches(&doc));
        assert!(matches!(fields.wait_state(&doc), WaitState::At(t) if t <= now));
        assert!(!filter.matches(&json!({"waitUntil": pending})));
        assert!(!filter.matches(&json!({"waitUntil": null, "lockUntil": pending})));
    }

    #[test]
    fn handler_view_carries_committed_lock() {
        let fields = FieldPaths::default();
        let locked_until = Utc::now();
        let claimed = ClaimedJob {
            job: Job::new(Default::default(), json!({"waitUntil": null})),
            locked_until,
        };
        let doc = claimed.with_lock(&fields);
        assert_eq!(doc["lockUntil"], encode_timestamp(locked_until));
        assert!(claimed.job.document.get("lockUntil").is_none());
    }
}
