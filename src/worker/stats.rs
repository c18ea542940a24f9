use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::document::JobId;
use crate::error::Result;

/// Timing record for one handled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub job_id: JobId,
    /// The document as it was claimed.
    pub document: Value,
    pub job_start: DateTime<Utc>,
    pub job_end: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub server_name: String,
    pub cron_name: String,
}

impl JobStatistics {
    pub fn new(
        job_id: JobId,
        document: Value,
        job_start: DateTime<Utc>,
        job_end: DateTime<Utc>,
        server_name: &str,
        cron_name: &str,
    ) -> Self {
        Self {
            job_id,
            document,
            job_start,
            job_end,
            execution_time_ms: (job_end - job_start).num_milliseconds(),
            server_name: server_name.to_string(),
            cron_name: cron_name.to_string(),
        }
    }
}

/// Destination for per-job statistics.
#[async_trait]
pub trait StatisticsSink: Send + Sync {
    async fn record(&self, stats: JobStatistics) -> Result<()>;
}

/// Keeps statistics in memory, newest last.
#[derive(Debug, Default)]
pub struct MemoryStatistics {
    entries: Mutex<Vec<JobStatistics>>,
}

impl MemoryStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<JobStatistics> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl StatisticsSink for MemoryStatistics {
    async fn record(&self, stats: JobStatistics) -> Result<()> {
        self.entries.lock().await.push(stats);
        Ok(())
    }
}
