//! SQLite-backed job store, namespace lock and statistics table.
//!
//! Documents are stored as JSON text and filtered with SQLite's JSON1
//! functions. Each [`SqliteJobStore::open`] call owns its own connection, so
//! several workers (or processes) opening the same file coordinate through
//! SQLite's locking: every read-modify-write runs in a `BEGIN IMMEDIATE`
//! transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::document::{decode_timestamp, encode_timestamp, validate_path, Job, JobId};
use crate::error::{CronError, Result};
use crate::namespace::NamespaceLock;
use crate::store::query::{Direction, Filter, GroupMax, Sort, Update};
use crate::store::JobStore;
use crate::worker::{JobStatistics, StatisticsSink};

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS cron_jobs (
        id  TEXT PRIMARY KEY,
        doc TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS cron_stats (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id            TEXT NOT NULL,
        document          TEXT NOT NULL,
        job_start         TEXT NOT NULL,
        job_end           TEXT NOT NULL,
        execution_time_ms INTEGER NOT NULL,
        server_name       TEXT NOT NULL,
        cron_name         TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS cron_locks (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );
";

/// One connection shared by a store and its lock service.
///
/// rusqlite calls block, so every operation runs on tokio's blocking pool
/// with the std mutex held there, never across an await.
#[derive(Clone)]
struct SharedConnection(Arc<Mutex<Connection>>);

impl SharedConnection {
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.0.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CronError::Store("sqlite connection mutex poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| CronError::Internal(format!("spawn_blocking join error: {}", e)))?
    }
}

#[derive(Clone)]
pub struct SqliteJobStore {
    conn: SharedConnection,
}

impl SqliteJobStore {
    /// Open (or create) a store file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// A private store that lives as long as this handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: SharedConnection(Arc::new(Mutex::new(conn))),
        })
    }

    /// Lock service sharing this store's connection.
    pub fn namespace_lock(&self) -> SqliteNamespaceLock {
        SqliteNamespaceLock {
            conn: self.conn.clone(),
        }
    }

    /// Most recent statistics rows, newest first.
    pub async fn recent_statistics(&self, limit: usize) -> Result<Vec<JobStatistics>> {
        let rows = self
            .conn
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, document, job_start, job_end, execution_time_ms, server_name, cron_name
                     FROM cron_stats ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, doc, start, end, ms, server, cron)| -> Result<JobStatistics> {
                let parse_time = |raw: String| {
                    decode_timestamp(&Value::String(raw.clone())).ok_or_else(|| {
                        CronError::Store(format!("malformed statistics timestamp '{}'", raw))
                    })
                };
                Ok(JobStatistics {
                    job_id: id.parse()?,
                    document: serde_json::from_str(&doc)?,
                    job_start: parse_time(start)?,
                    job_end: parse_time(end)?,
                    execution_time_ms: ms,
                    server_name: server,
                    cron_name: cron,
                })
            })
            .collect()
    }
}

fn decode_row(id: String, doc: String) -> Result<Job> {
    Ok(Job::new(id.parse()?, serde_json::from_str(&doc)?))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, document: Value) -> Result<JobId> {
        let id = JobId::new();
        let doc = serde_json::to_string(&document)?;
        self.conn
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO cron_jobs (id, doc) VALUES (?1, ?2)",
                    params![id.to_string(), doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let id = *id;
        let doc: Option<String> = self
            .conn
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT doc FROM cron_jobs WHERE id = ?1",
                        params![id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match doc {
            Some(doc) => Ok(Some(Job::new(id, serde_json::from_str(&doc)?))),
            None => Ok(None),
        }
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Job>> {
        let mut compiler = FilterCompiler::default();
        let clause = compiler.compile(filter)?;
        let sql = format!("SELECT id, doc FROM cron_jobs WHERE {} ORDER BY id", clause);
        let params = compiler.params;

        let rows = self
            .conn
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(params.iter()), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(|(id, doc)| decode_row(id, doc)).collect()
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        let mut compiler = FilterCompiler::default();
        let clause = compiler.compile(filter)?;
        let sql = format!("SELECT COUNT(*) FROM cron_jobs WHERE {}", clause);
        let params = compiler.params;

        let count: i64 = self
            .conn
            .run(move |conn| {
                Ok(conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?)
            })
            .await?;
        Ok(count as usize)
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: Option<&Sort>,
    ) -> Result<Option<Job>> {
        let mut compiler = FilterCompiler::default();
        let clause = compiler.compile(filter)?;
        let order = match sort {
            Some(sort) => {
                let column = if sort.instants {
                    compiler.instant(&sort.path)?
                } else {
                    compiler.extract(&sort.path)?
                };
                let direction = match sort.direction {
                    Direction::Ascending => "ASC",
                    Direction::Descending => "DESC",
                };
                format!("{} {}, id ASC", column, direction)
            }
            None => "id ASC".to_string(),
        };
        let sql = format!(
            "SELECT id, doc FROM cron_jobs WHERE {} ORDER BY {} LIMIT 1",
            clause, order
        );
        let params = compiler.params;
        let update = update.clone();

        self.conn
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let row: Option<(String, String)> = tx
                    .query_row(&sql, params_from_iter(params.iter()), |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;

                let Some((id, doc)) = row else {
                    return Ok(None);
                };
                let original = decode_row(id.clone(), doc)?;
                let mut updated = original.document.clone();
                update.apply(&mut updated);
                tx.execute(
                    "UPDATE cron_jobs SET doc = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&updated)?, id],
                )?;
                tx.commit()?;
                Ok(Some(original))
            })
            .await
    }

    async fn update_one(&self, id: &JobId, update: &Update) -> Result<bool> {
        let key = id.to_string();
        let update = update.clone();
        self.conn
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let doc: Option<String> = tx
                    .query_row(
                        "SELECT doc FROM cron_jobs WHERE id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(doc) = doc else {
                    return Ok(false);
                };

                let mut document: Value = serde_json::from_str(&doc)?;
                update.apply(&mut document);
                tx.execute(
                    "UPDATE cron_jobs SET doc = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&document)?, key],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    async fn delete_one(&self, id: &JobId) -> Result<bool> {
        let key = id.to_string();
        self.conn
            .run(move |conn| {
                let removed = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", params![key])?;
                Ok(removed > 0)
            })
            .await
    }

    async fn group_max(
        &self,
        filter: &Filter,
        group_path: &str,
        max_path: &str,
    ) -> Result<Vec<GroupMax>> {
        let mut compiler = FilterCompiler::default();
        // Placeholders bind in textual order, so the select list goes first.
        let key = compiler.extract(group_path)?;
        let max = compiler.extract(max_path)?;
        let key_type = compiler.json_type(group_path)?;
        let clause = compiler.compile(filter)?;
        let sql = format!(
            "SELECT {key} AS grp, MAX({max}) AS latest FROM cron_jobs
             WHERE {key_type} = 'text' AND ({clause})
             GROUP BY grp ORDER BY latest ASC, grp ASC"
        );
        let params = compiler.params;

        let groups = self
            .conn
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let groups = stmt
                    .query_map(params_from_iter(params.iter()), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, SqlValue>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(groups)
            })
            .await?;

        Ok(groups
            .into_iter()
            .map(|(key, max)| GroupMax {
                key,
                max: sql_to_json(max),
            })
            .collect())
    }
}

#[async_trait]
impl StatisticsSink for SqliteJobStore {
    async fn record(&self, stats: JobStatistics) -> Result<()> {
        let document = serde_json::to_string(&stats.document)?;
        self.conn
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO cron_stats
                        (job_id, document, job_start, job_end, execution_time_ms, server_name, cron_name)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        stats.job_id.to_string(),
                        document,
                        timestamp_text(stats.job_start),
                        timestamp_text(stats.job_end),
                        stats.execution_time_ms,
                        stats.server_name,
                        stats.cron_name,
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

/// Namespace ownership kept in the `cron_locks` table.
#[derive(Clone)]
pub struct SqliteNamespaceLock {
    conn: SharedConnection,
}

impl SqliteNamespaceLock {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(SqliteJobStore::open(path)?.namespace_lock())
    }
}

fn lock_ttl(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| CronError::LockService(format!("invalid lock ttl: {}", e)))
}

#[async_trait]
impl NamespaceLock for SqliteNamespaceLock {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl = lock_ttl(ttl)?;
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .run(move |conn| {
                let now = Utc::now();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM cron_locks WHERE key = ?1 AND expires_at <= ?2",
                    params![key, timestamp_text(now)],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO cron_locks (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, value, timestamp_text(now + ttl)],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await
    }

    async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl = lock_ttl(ttl)?;
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .run(move |conn| {
                let now = Utc::now();
                let updated = conn.execute(
                    "UPDATE cron_locks SET expires_at = ?3
                     WHERE key = ?1 AND value = ?2 AND expires_at > ?4",
                    params![key, value, timestamp_text(now + ttl), timestamp_text(now)],
                )?;
                Ok(updated == 1)
            })
            .await
    }

    async fn delete(&self, key: &str, value: &str) -> Result<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .run(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM cron_locks WHERE key = ?1 AND value = ?2",
                    params![key, value],
                )?;
                Ok(removed > 0)
            })
            .await
    }
}

fn timestamp_text(t: chrono::DateTime<Utc>) -> String {
    match encode_timestamp(t) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn sql_to_json(value: SqlValue) -> Option<Value> {
    match value {
        SqlValue::Null => None,
        SqlValue::Integer(i) => Some(Value::from(i)),
        SqlValue::Real(f) => serde_json::Number::from_f64(f).map(Value::Number),
        SqlValue::Text(s) => Some(Value::String(s)),
        SqlValue::Blob(_) => None,
    }
}

/// Translates a [`Filter`] into a SQL boolean expression over `doc`.
///
/// Every emitted expression evaluates to 0 or 1, never NULL, so `NOT` keeps
/// the same meaning as [`Filter::matches`].
#[derive(Default)]
struct FilterCompiler {
    params: Vec<SqlValue>,
}

impl FilterCompiler {
    fn compile(&mut self, filter: &Filter) -> Result<String> {
        let sql = match filter {
            Filter::And(filters) if filters.is_empty() => "1".to_string(),
            Filter::Or(filters) if filters.is_empty() => "0".to_string(),
            Filter::And(filters) => self.join(filters, " AND ")?,
            Filter::Or(filters) => self.join(filters, " OR ")?,
            Filter::Not(inner) => format!("NOT ({})", self.compile(inner)?),
            Filter::Exists(path) => format!("{} IS NOT NULL", self.json_type(path)?),
            Filter::Missing(path) => format!("{} IS NULL", self.json_type(path)?),
            Filter::IsNull(path) => format!("IFNULL({} = 'null', 0)", self.json_type(path)?),
            Filter::Eq(path, value) => self.equals(path, value)?,
            Filter::In(path, values) if values.is_empty() => {
                validate_path(path)?;
                "0".to_string()
            }
            Filter::In(path, values) => {
                let parts = values
                    .iter()
                    .map(|value| self.equals(path, value))
                    .collect::<Result<Vec<_>>>()?;
                format!("({})", parts.join(" OR "))
            }
            Filter::Lte(path, value) => self.range(path, "<=", value)?,
            Filter::Gt(path, value) => self.range(path, ">", value)?,
            Filter::AtOrBefore(path, at) => {
                let instant = self.instant(path)?;
                let param = self.bind(SqlValue::Text(timestamp_text(*at)));
                format!("IFNULL({instant} <= {param}, 0)")
            }
        };
        Ok(sql)
    }

    fn join(&mut self, filters: &[Filter], separator: &str) -> Result<String> {
        let parts = filters
            .iter()
            .map(|f| self.compile(f).map(|sql| format!("({})", sql)))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(separator))
    }

    fn json_type(&mut self, path: &str) -> Result<String> {
        self.params.push(SqlValue::Text(json_path(path)?));
        Ok("json_type(doc, ?)".to_string())
    }

    fn extract(&mut self, path: &str) -> Result<String> {
        self.params.push(SqlValue::Text(json_path(path)?));
        Ok("json_extract(doc, ?)".to_string())
    }

    /// The field as canonical UTC text (`...T18:50:09.880Z`), or NULL when
    /// it is not a parseable timestamp string. Canonical text orders like
    /// the instant it names.
    fn instant(&mut self, path: &str) -> Result<String> {
        let ty = self.json_type(path)?;
        let column = self.extract(path)?;
        Ok(format!(
            "CASE WHEN {ty} = 'text' THEN strftime('%Y-%m-%dT%H:%M:%fZ', {column}) END"
        ))
    }

    fn bind(&mut self, value: SqlValue) -> &'static str {
        self.params.push(value);
        "?"
    }

    fn equals(&mut self, path: &str, value: &Value) -> Result<String> {
        let sql = match value {
            Value::Null => format!("IFNULL({} = 'null', 0)", self.json_type(path)?),
            Value::Bool(true) => format!("IFNULL({} = 'true', 0)", self.json_type(path)?),
            Value::Bool(false) => format!("IFNULL({} = 'false', 0)", self.json_type(path)?),
            Value::String(s) => {
                let ty = self.json_type(path)?;
                let column = self.extract(path)?;
                let param = self.bind(SqlValue::Text(s.clone()));
                format!("IFNULL({ty} = 'text' AND {column} = {param}, 0)")
            }
            Value::Number(n) => {
                let ty = self.json_type(path)?;
                let column = self.extract(path)?;
                let param = self.bind(number_param(n));
                format!("IFNULL({ty} IN ('integer', 'real') AND {column} = {param}, 0)")
            }
            Value::Array(_) | Value::Object(_) => {
                let ty = self.json_type(path)?;
                let column = self.extract(path)?;
                let param = self.bind(SqlValue::Text(value.to_string()));
                format!("IFNULL({ty} IN ('array', 'object') AND {column} = json({param}), 0)")
            }
        };
        Ok(sql)
    }

    fn range(&mut self, path: &str, op: &str, value: &Value) -> Result<String> {
        let (types, param) = match value {
            Value::String(s) => ("('text')", SqlValue::Text(s.clone())),
            Value::Number(n) => ("('integer', 'real')", number_param(n)),
            Value::Bool(b) => ("('true', 'false')", SqlValue::Integer(i64::from(*b))),
            Value::Null | Value::Array(_) | Value::Object(_) => {
                validate_path(path)?;
                return Ok("0".to_string());
            }
        };
        let ty = self.json_type(path)?;
        let column = self.extract(path)?;
        let param = self.bind(param);
        Ok(format!("IFNULL({ty} IN {types} AND {column} {op} {param}, 0)"))
    }
}

fn number_param(n: &serde_json::Number) -> SqlValue {
    match n.as_i64() {
        Some(i) => SqlValue::Integer(i),
        None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
    }
}

/// `cron.waitUntil` becomes `$."cron"."waitUntil"`.
fn json_path(path: &str) -> Result<String> {
    validate_path(path)?;
    let mut out = String::from("$");
    for segment in path.split('.') {
        out.push_str(".\"");
        out.push_str(segment);
        out.push('"');
    }
    Ok(out)
}
