
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cron_lite::document::{FieldPaths, NewJob};
use cron_lite::scheduler::ClaimProtocol;
use cron_lite::store::{JobStore, SqliteJobStore};
use cron_lite::worker::CronWorker;
use serde_json::json;
use test_harness::{assert_eventually, test_config, RecordingHandler};

/// Separate connections to one file never hand out the same job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claims_across_connections_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let first = Arc::new(SqliteJobStore::open(&path).unwrap());
    let second = Arc::new(SqliteJobStore::open(&path).unwrap());

    for i in 0..30 {
        let doc = NewJob::ready()
            .with_data(json!({"seq": i}))
            .into_document(&FieldPaths::default());
        first.insert(doc).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..6 {
        let store: Arc<dyn JobStore> = if n % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        let claim = ClaimProtocol::new(store, FieldPaths::default(), Duration::from_secs(60), None);
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            while let Some(claimed) = claim.claim_next(None, None).await.unwrap() {
                won.push(claimed.job.id);
            }
            won
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}

/// A worker runs end to end on SQLite and leaves statistics rows behind.
#[tokio::test]
async fn test_worker_on_sqlite_records_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteJobStore::open(dir.path().join("jobs.db")).unwrap());
    let fields = FieldPaths::default();

    let once = store
        .insert(NewJob::ready().with_auto_remove(true).into_document(&fields))
        .await
        .unwrap();
    let recurring = store
        .insert(NewJob::ready().with_interval("0 0 0 1 1 *").into_document(&fields))
        .await
        .unwrap();

    let handler = RecordingHandler::new("w");
    let worker = CronWorker::builder(store.clone(), handler.clone())
        .config(test_config().with_cron_name("sqlite"))
        .statistics(store.clone())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    assert_eventually(
        || async { handler.finished_count() == 2 },
        Duration::from_secs(3),
        "Both jobs should be handled",
    )
    .await;
    assert_eventually(
        || async { worker.is_idle() },
        Duration::from_secs(2),
        "Worker should go idle",
    )
    .await;
    worker.stop(false).await.unwrap();

    assert!(store.get(&once).await.unwrap().is_none());
    let rearmed = store.get(&recurring).await.unwrap().unwrap().document;
    assert!(rearmed["waitUntil"].is_string());
    assert!(rearmed.get("lockUntil").is_none());

    let stats = store.recent_statistics(10).await.unwrap();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.cron_name == "sqlite"));
    let ids: HashSet<_> = stats.iter().map(|s| s.job_id).collect();
    assert_eq!(ids, HashSet::from([once, recurring]));
}

/// Dedicated workers can share one SQLite file for both jobs and locks.
#[tokio::test]
async fn test_dedication_with_sqlite_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let store = Arc::new(SqliteJobStore::open(&path).unwrap());
    let fields = FieldPaths::default();
    for ns in ["A", "A", "B"] {
        let doc = NewJob::ready()
            .with_namespace(ns)
            .with_data(json!({"sleep_ms": 100}))
            .into_document(&fields);
        store.insert(doc).await.unwrap();
    }

    let mut workers = Vec::new();
    let mut handlers = Vec::new();
    for name in ["w1", "w2"] {
        let handle = Arc::new(SqliteJobStore::open(&path).unwrap());
        let handler = RecordingHandler::new(name);
        let worker = CronWorker::builder(handle.clone(), handler.clone())
            .config(test_config().with_namespace_dedication(true))
            .namespace_lock(Arc::new(handle.namespace_lock()))
            .build()
            .unwrap();
        worker.start().await.unwrap();
        workers.push(worker);
        handlers.push(handler);
    }

    assert_eventually(
        || async { handlers.iter().map(|h| h.finished_count()).sum::<usize>() == 3 },
        Duration::from_secs(5),
        "All jobs should be handled",
    )
    .await;
    for worker in &workers {
        worker.stop(false).await.unwrap();
    }

    let holders: Vec<usize> = handlers
        .iter()
        .map(|h| {
            h.finished()
                .iter()
                .filter(|j| j.document["namespace"] == json!("A"))
                .count()
        })
        .collect();
    assert!(holders.contains(&2), "namespace A was split: {:?}", holders);
}
