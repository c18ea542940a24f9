//! Job documents and the mapping from logical job roles to document fields.
//!
//! A job is an arbitrary JSON object. The scheduler only ever touches the
//! handful of fields named by [`FieldPaths`]; everything else belongs to the
//! producer and is passed through untouched.
//!
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision
//! (see [`encode_timestamp`]) so that stores can order and compare them as
//! plain strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CronError, Result};

/// Immutable identity of a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CronError::Internal(format!("invalid job id '{}': {}", s, e)))
    }
}

/// A stored job: its identity plus the full document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub document: Value,
}

impl Job {
    pub fn new(id: JobId, document: Value) -> Self {
        Self { id, document }
    }
}

/// Scheduling state carried by the `waitUntil` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Field absent: the job is not scheduled and will never be claimed.
    Inert,
    /// Field is `null`: eligible immediately.
    Ready,
    /// Eligible once this instant has passed.
    At(DateTime<Utc>),
}

/// Encode a timestamp the way every store expects to find it.
pub fn encode_timestamp(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Decode a stored timestamp; non-string or malformed values yield `None`.
pub fn decode_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Read the value at a dotted path (`"cron.waitUntil"`).
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

/// Write `value` at a dotted path, creating intermediate objects as needed.
///
/// Intermediate values that are not objects are replaced.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(key) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(key.to_string(), value);
            return;
        }
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at a dotted path. Missing paths are ignored.
pub fn unset_path(doc: &mut Value, path: &str) {
    let (parent, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (get_path_mut(doc, parent), key),
        None => (Some(doc), path),
    };
    if let Some(Value::Object(map)) = parent {
        map.remove(key);
    }
}

fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(doc, |current, key| current.get_mut(key))
}

/// Validate a dotted field path.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CronError::Config("field path must not be empty".to_string()));
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(CronError::Config(format!(
                "field path '{}' contains an empty segment",
                path
            )));
        }
        if segment.contains('"') || segment.contains('\\') {
            return Err(CronError::Config(format!(
                "field path '{}' contains a quote or backslash",
                path
            )));
        }
    }
    Ok(())
}

/// Where each scheduling role lives inside a job document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPaths {
    pub wait_until: String,
    pub lock_until: String,
    pub interval: String,
    pub repeat_until: String,
    pub auto_remove: String,
    pub namespace: String,
}

impl Default for FieldPaths {
    fn default() -> Self {
        Self {
            wait_until: "waitUntil".to_string(),
            lock_until: "lockUntil".to_string(),
            interval: "interval".to_string(),
            repeat_until: "repeatUntil".to_string(),
            auto_remove: "autoRemove".to_string(),
            namespace: "namespace".to_string(),
        }
    }
}

impl FieldPaths {
    pub fn validate(&self) -> Result<()> {
        for path in [
            &self.wait_until,
            &self.lock_until,
            &self.interval,
            &self.repeat_until,
            &self.auto_remove,
            &self.namespace,
        ] {
            validate_path(path)?;
        }
        if self.wait_until == self.lock_until {
            return Err(CronError::Config(
                "waitUntil and lockUntil must be stored in different fields".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wait_state(&self, doc: &Value) -> WaitState {
        match get_path(doc, &self.wait_until) {
            None => WaitState::Inert,
            Some(Value::Null) => WaitState::Ready,
            Some(value) => match decode_timestamp(value) {
                Some(t) => WaitState::At(t),
                None => {
                    tracing::warn!(
                        field = %self.wait_until,
                        value = %value,
                        "Unreadable waitUntil value, treating job as inert"
                    );
                    WaitState::Inert
                }
            },
        }
    }

    pub fn lock_until(&self, doc: &Value) -> Option<DateTime<Utc>> {
        get_path(doc, &self.lock_until).and_then(decode_timestamp)
    }

    /// The recurrence rule; empty strings count as absent.
    pub fn interval<'a>(&self, doc: &'a Value) -> Option<&'a str> {
        get_path(doc, &self.interval)
            .and_then(Value::as_str)
            .filter(|rule| !rule.trim().is_empty())
    }

    pub fn repeat_until(&self, doc: &Value) -> Option<DateTime<Utc>> {
        get_path(doc, &self.repeat_until).and_then(decode_timestamp)
    }

    pub fn auto_remove(&self, doc: &Value) -> bool {
        matches!(get_path(doc, &self.auto_remove), Some(Value::Bool(true)))
    }

    pub fn namespace<'a>(&self, doc: &'a Value) -> Option<&'a str> {
        get_path(doc, &self.namespace).and_then(Value::as_str)
    }

    pub fn set_wait_state(&self, doc: &mut Value, state: WaitState) {
        match state {
            WaitState::Inert => unset_path(doc, &self.wait_until),
            WaitState::Ready => set_path(doc, &self.wait_until, Value::Null),
            WaitState::At(t) => set_path(doc, &self.wait_until, encode_timestamp(t)),
        }
    }

    pub fn set_lock_until(&self, doc: &mut Value, until: Option<DateTime<Utc>>) {
        match until {
            Some(t) => set_path(doc, &self.lock_until, encode_timestamp(t)),
            None => unset_path(doc, &self.lock_until),
        }
    }
}

/// Convenience builder for producers inserting jobs.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub wait: WaitState,
    pub interval: Option<String>,
    pub repeat_until: Option<DateTime<Utc>>,
    pub auto_remove: bool,
    pub namespace: Option<String>,
    pub data: Value,
}

impl NewJob {
    /// A job that is eligible immediately.
    pub fn ready() -> Self {
        Self {
            wait: WaitState::Ready,
            interval: None,
            repeat_until: None,
            auto_remove: false,
            namespace: None,
            data: Value::Object(Map::new()),
        }
    }

    /// A job that becomes eligible at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            wait: WaitState::At(at),
            ..Self::ready()
        }
    }

    pub fn with_interval(mut self, rule: impl Into<String>) -> Self {
        self.interval = Some(rule.into());
        self
    }

    pub fn with_repeat_until(mut self, until: DateTime<Utc>) -> Self {
        self.repeat_until = Some(until);
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// User fields merged into the document. Non-object values are stored under `data`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn into_document(self, fields: &FieldPaths) -> Value {
        let mut doc = match self.data {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Map::new()),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                Value::Object(map)
            }
        };
        fields.set_wait_state(&mut doc, self.wait);
        if let Some(rule) = self.interval {
            set_path(&mut doc, &fields.interval, Value::String(rule));
        }
        if let Some(until) = self.repeat_until {
            set_path(&mut doc, &fields.repeat_until, encode_timestamp(until));
        }
        if self.auto_remove {
            set_path(&mut doc, &fields.auto_remove, Value::Bool(true));
        }
        if let Some(ns) = self.namespace {
            set_path(&mut doc, &fields.namespace, Value::String(ns));
        }
        doc
    }
}
