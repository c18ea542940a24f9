use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{decode_timestamp, get_path, set_path, unset_path};

/// Predicate over job documents.
///
/// Every store evaluates the same tree, so eligibility rules are written once
/// and pushed down to whatever backend holds the jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Field present and equal to the value.
    Eq(String, Value),
    /// Field present and equal to one of the values.
    In(String, Vec<Value>),
    /// Field present (a `null` counts as present).
    Exists(String),
    /// Field absent.
    Missing(String),
    /// Field present and `null`.
    IsNull(String),
    /// Field present, comparable with the value and less than or equal to it.
    Lte(String, Value),
    /// Field present, comparable with the value and greater than it.
    Gt(String, Value),
    /// Field holds an RFC 3339 timestamp at or before the instant, whatever
    /// its offset or fractional precision.
    AtOrBefore(String, DateTime<Utc>),
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Filter::Exists(path.into())
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Filter::Missing(path.into())
    }

    pub fn is_null(path: impl Into<String>) -> Self {
        Filter::IsNull(path.into())
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(path.into(), value.into())
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(path.into(), value.into())
    }

    pub fn at_or_before(path: impl Into<String>, at: DateTime<Utc>) -> Self {
        Filter::AtOrBefore(path.into(), at)
    }

    pub fn one_of(path: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Filter::In(path.into(), values.into_iter().collect())
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Not(filter) => !filter.matches(doc),
            Filter::Eq(path, value) => get_path(doc, path) == Some(value),
            Filter::In(path, values) => {
                get_path(doc, path).is_some_and(|found| values.contains(found))
            }
            Filter::Exists(path) => get_path(doc, path).is_some(),
            Filter::Missing(path) => get_path(doc, path).is_none(),
            Filter::IsNull(path) => matches!(get_path(doc, path), Some(Value::Null)),
            Filter::Lte(path, value) => get_path(doc, path)
                .and_then(|found| compare_values(found, value))
                .is_some_and(|ord| ord != Ordering::Greater),
            Filter::Gt(path, value) => get_path(doc, path)
                .and_then(|found| compare_values(found, value))
                .is_some_and(|ord| ord == Ordering::Greater),
            Filter::AtOrBefore(path, at) => get_path(doc, path)
                .and_then(decode_timestamp)
                .is_some_and(|found| found <= *at),
        }
    }
}

/// Order two JSON scalars of the same kind. Mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Field assignments and removals applied to a single document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub set: Vec<(String, Value)>,
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply removals first, then assignments.
    pub fn apply(&self, doc: &mut Value) {
        for path in &self.unset {
            unset_path(doc, path);
        }
        for (path, value) in &self.set {
            set_path(doc, path, value.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ordering used to pick among several matching documents.
///
/// Absent and `null` values sort before everything else when ascending.
/// Ties are broken by job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub path: String,
    pub direction: Direction,
    /// Order by the decoded instant instead of the raw value. Values that
    /// are not timestamps sort like absent ones.
    #[serde(default)]
    pub instants: bool,
}

impl Sort {
    pub fn ascending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Ascending,
            instants: false,
        }
    }

    pub fn descending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Descending,
            instants: false,
        }
    }

    pub fn by_instant(mut self) -> Self {
        self.instants = true;
        self
    }

    /// Compare two documents on the sort field only.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let (a, b) = (get_path(a, &self.path), get_path(b, &self.path));
        let ord = if self.instants {
            // None < Some, matching the null-first rule
            a.and_then(decode_timestamp).cmp(&b.and_then(decode_timestamp))
        } else {
            sort_key_cmp(a, b)
        };
        match self.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        }
    }
}

pub(crate) fn sort_key_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// One row of a grouped maximum: the group key and the largest value seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMax {
    pub key: String,
    pub max: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_is_present_but_not_comparable() {
        let doc = json!({"waitUntil": null});
        assert!(Filter::exists("waitUntil").matches(&doc));
        assert!(Filter::is_null("waitUntil").matches(&doc));
        assert!(!Filter::missing("waitUntil").matches(&doc));
        assert!(!Filter::lte("waitUntil", "2026-01-01T00:00:00.000Z").matches(&doc));
    }

    #[test]
    fn lte_compares_timestamps_as_strings() {
        let doc = json!({"lockUntil": "2026-01-01T00:00:00.000Z"});
        assert!(Filter::lte("lockUntil", "2026-01-01T00:00:00.000Z").matches(&doc));
        assert!(Filter::lte("lockUntil", "2026-06-01T00:00:00.000Z").matches(&doc));
        assert!(!Filter::lte("lockUntil", "2025-12-31T23:59:59.999Z").matches(&doc));
        assert!(Filter::gt("lockUntil", "2025-12-31T23:59:59.999Z").matches(&doc));
    }

    #[test]
    fn instant_filter_honours_offsets() {
        let at = "2026-10-18T19:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let filter = Filter::at_or_before("waitUntil", at);

        // 18:50Z written with a +05:00 offset sorts after "2026-10-18T19" as text
        assert!(filter.matches(&json!({"waitUntil": "2026-10-18T23:50:09.88+05:00"})));
        // 20:00Z written with a -05:00 offset sorts before it as text
        assert!(!filter.matches(&json!({"waitUntil": "2026-10-18T15:00:00-05:00"})));
        assert!(filter.matches(&json!({"waitUntil": "2026-10-18T19:00:00.000Z"})));
        assert!(!filter.matches(&json!({"waitUntil": null})));
        assert!(!filter.matches(&json!({"waitUntil": "soon"})));
        assert!(!filter.matches(&json!({"waitUntil": 5})));
    }

    #[test]
    fn instant_sort_orders_across_offsets() {
        let sort = Sort::ascending("waitUntil").by_instant();
        let late = json!({"waitUntil": "2026-10-18T15:00:00-05:00"});
        let early = json!({"waitUntil": "2026-10-18T23:50:00+05:00"});
        let ready = json!({"waitUntil": null});
        assert_eq!(sort.compare(&early, &late), Ordering::Less);
        assert_eq!(sort.compare(&ready, &early), Ordering::Less);
    }

    #[test]
    fn mixed_kinds_never_match_range_filters() {
        let doc = json!({"n": 5});
        assert!(!Filter::lte("n", "9").matches(&doc));
        assert!(Filter::lte("n", 5).matches(&doc));
    }

    #[test]
    fn boolean_combinators() {
        let doc = json!({"handle": true, "namespace": "a"});
        let filter = Filter::And(vec![
            Filter::eq("handle", true),
            Filter::Or(vec![
                Filter::missing("namespace"),
                Filter::one_of("namespace", [json!("a"), json!("b")]),
            ]),
        ]);
        assert!(filter.matches(&doc));
        assert!(!filter.clone().negate().matches(&doc));
    }

    #[test]
    fn update_unsets_before_setting() {
        let mut doc = json!({"lockUntil": "x", "waitUntil": null});
        Update::new()
            .unset("lockUntil")
            .set("waitUntil", "2026-01-01T00:00:00.000Z")
            .apply(&mut doc);
        assert_eq!(doc, json!({"waitUntil": "2026-01-01T00:00:00.000Z"}));
    }

    #[test]
    fn ascending_sort_puts_null_first() {
        let sort = Sort::ascending("waitUntil");
        let ready = json!({"waitUntil": null});
        let later = json!({"waitUntil": "2026-01-01T00:00:00.000Z"});
        assert_eq!(sort.compare(&ready, &later), Ordering::Less);
        assert_eq!(
            Sort::descending("waitUntil").compare(&ready, &later),
            Ordering::Greater
        );
    }
}
