
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use cron_lite::document::{encode_timestamp, FieldPaths, NewJob};
use cron_lite::scheduler::{ClaimProtocol, NamespaceScope};
use cron_lite::store::{Filter, JobStore, MemoryJobStore, SqliteJobStore};
use serde_json::json;

fn protocol(store: Arc<dyn JobStore>, lock: Duration) -> ClaimProtocol {
    ClaimProtocol::new(store, FieldPaths::default(), lock, None)
}

async fn insert_ready(store: &dyn JobStore, n: usize) {
    for i in 0..n {
        let doc = NewJob::ready()
            .with_data(json!({"seq": i}))
            .into_document(&FieldPaths::default());
        store.insert(doc).await.unwrap();
    }
}

/// Many concurrent claimers never receive the same job twice.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_overlap() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    insert_ready(store.as_ref(), 50).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let claim = protocol(store.clone(), Duration::from_secs(60));
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            while let Some(claimed) = claim.claim_next(None, None).await.unwrap() {
                won.push(claimed.job.id);
                tokio::task::yield_now().await;
            }
            won
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 50, "every job should be claimed");
    assert_eq!(unique.len(), 50, "no job may be claimed twice");
}

/// A job scheduled in the future is not claimable until its time arrives.
#[tokio::test]
async fn test_future_job_is_gated_until_due() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let due = Utc::now() + chrono::Duration::milliseconds(300);
    let id = store
        .insert(NewJob::at(due).into_document(&FieldPaths::default()))
        .await
        .unwrap();
    let claim = protocol(store.clone(), Duration::from_secs(60));

    assert!(claim.claim_next(None, None).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let claimed = claim.claim_next(None, None).await.unwrap().unwrap();
    assert_eq!(claimed.job.id, id);
}

/// A lock left behind by a dead worker expires and the job is claimable again.
#[tokio::test]
async fn test_expired_lock_is_recovered() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    insert_ready(store.as_ref(), 1).await;
    let claim = protocol(store.clone(), Duration::from_millis(100));

    let first = claim.claim_next(None, None).await.unwrap().unwrap();
    assert!(claim.claim_next(None, None).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = claim.claim_next(None, None).await.unwrap().unwrap();
    assert_eq!(second.job.id, first.job.id);
    assert!(second.locked_until > first.locked_until);
}

/// The claim hands back the pre-lock document and writes the lock to the store.
#[tokio::test]
async fn test_claim_returns_document_before_lock() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    insert_ready(store.as_ref(), 1).await;
    let claim = protocol(store.clone(), Duration::from_secs(60));

    let claimed = claim.claim_next(None, None).await.unwrap().unwrap();
    assert!(claimed.job.document.get("lockUntil").is_none());

    let stored = store.get(&claimed.job.id).await.unwrap().unwrap();
    assert_eq!(stored.document["lockUntil"], encode_timestamp(claimed.locked_until));
}

/// Earliest deadline first; a `null` waitUntil counts as the earliest.
#[tokio::test]
async fn test_claims_follow_earliest_deadline() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let fields = FieldPaths::default();
    let now = Utc::now();

    let recent = store
        .insert(NewJob::at(now - chrono::Duration::seconds(1)).into_document(&fields))
        .await
        .unwrap();
    let oldest = store
        .insert(NewJob::at(now - chrono::Duration::seconds(30)).into_document(&fields))
        .await
        .unwrap();
    let ready = store
        .insert(NewJob::ready().into_document(&fields))
        .await
        .unwrap();

    let claim = protocol(store.clone(), Duration::from_secs(60));
    let mut order = Vec::new();
    while let Some(claimed) = claim.claim_next(None, None).await.unwrap() {
        order.push(claimed.job.id);
    }
    assert_eq!(order, vec![ready, oldest, recent]);
}

/// Inert jobs (no waitUntil) are never claimed.
#[tokio::test]
async fn test_inert_job_is_never_claimed() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    store.insert(json!({"interval": "* * * * * *"})).await.unwrap();
    let claim = protocol(store.clone(), Duration::from_secs(60));
    assert!(claim.claim_next(None, None).await.unwrap().is_none());
}

/// The configured condition, the caller's extra filter and the namespace
/// scope all narrow the claim.
#[tokio::test]
async fn test_filters_narrow_the_claim() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let fields = FieldPaths::default();
    for (kind, ns) in [("report", "a"), ("report", "b"), ("email", "a")] {
        let doc = NewJob::ready()
            .with_namespace(ns)
            .with_data(json!({"kind": kind}))
            .into_document(&fields);
        store.insert(doc).await.unwrap();
    }

    let claim = ClaimProtocol::new(
        store.clone(),
        fields,
        Duration::from_secs(60),
        Some(Filter::eq("kind", "report")),
    );
    let scope = NamespaceScope::Only("b".to_string());

    let claimed = claim.claim_next(None, Some(&scope)).await.unwrap().unwrap();
    assert_eq!(claimed.job.document["namespace"], json!("b"));
    assert!(claim.claim_next(None, Some(&scope)).await.unwrap().is_none());

    let extra = Filter::eq("namespace", "a");
    let claimed = claim.claim_next(Some(&extra), None).await.unwrap().unwrap();
    assert_eq!(claimed.job.document["kind"], json!("report"));
    assert!(claim.claim_next(None, None).await.unwrap().is_none());
}

/// Producers may write waitUntil in any offset; due-ness and claim order
/// follow the instant, on both stores.
#[tokio::test]
async fn test_offset_timestamps_are_read_as_instants() {
    let stores: [Arc<dyn JobStore>; 2] = [
        Arc::new(MemoryJobStore::new()),
        Arc::new(SqliteJobStore::open_in_memory().unwrap()),
    ];
    for store in stores {
        let now = Utc::now();
        let east = FixedOffset::east_opt(5 * 3600).unwrap();
        let west = FixedOffset::west_opt(5 * 3600).unwrap();

        let hour_ago = (now - chrono::Duration::hours(1)).with_timezone(&east);
        let overdue = store
            .insert(json!({"waitUntil": hour_ago.to_rfc3339()}))
            .await
            .unwrap();
        let recent = store
            .insert(json!({"waitUntil": encode_timestamp(now - chrono::Duration::minutes(30))}))
            .await
            .unwrap();
        let hour_ahead = (now + chrono::Duration::hours(1)).with_timezone(&west);
        store
            .insert(json!({"waitUntil": hour_ahead.to_rfc3339()}))
            .await
            .unwrap();

        let claim = protocol(store.clone(), Duration::from_secs(60));
        let first = claim.claim_next(None, None).await.unwrap().unwrap();
        let second = claim.claim_next(None, None).await.unwrap().unwrap();
        assert_eq!(first.job.id, overdue, "earliest instant goes first");
        assert_eq!(second.job.id, recent);
        assert!(claim.claim_next(None, None).await.unwrap().is_none());
    }
}
