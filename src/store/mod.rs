//! Document stores that hold job documents.
//!
//! The scheduler needs a single atomic primitive from its store:
//! [`JobStore::find_one_and_update`], which matches one document, applies an
//! update and hands back the document as it was before the update, with no
//! other caller able to observe or modify it in between. Everything else
//! (targeted updates, deletes, the grouped maximum used by namespace
//! discovery) is ordinary CRUD.
//!
//! # Implementations
//!
//! - [`MemoryJobStore`]: in-process map behind an async mutex. Shared by
//!   workers in the same process; used heavily by tests.
//! - [`SqliteJobStore`]: SQLite file shared by any number of processes.
//!   Claims run in `BEGIN IMMEDIATE` transactions.

pub mod memory;
pub mod query;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::document::{Job, JobId};
use crate::error::Result;

pub use memory::MemoryJobStore;
pub use query::{Direction, Filter, GroupMax, Sort, Update};
pub use sqlite::{SqliteJobStore, SqliteNamespaceLock};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new document and return its id.
    async fn insert(&self, document: Value) -> Result<JobId>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// All documents matching the filter, ordered by id.
    async fn find(&self, filter: &Filter) -> Result<Vec<Job>>;

    async fn count(&self, filter: &Filter) -> Result<usize>;

    /// Atomically pick the first document matching `filter` (by `sort`, then
    /// id), apply `update` to it and return the pre-update document.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: Option<&Sort>,
    ) -> Result<Option<Job>>;

    /// Apply `update` to one document. Returns false if the id is unknown.
    async fn update_one(&self, id: &JobId, update: &Update) -> Result<bool>;

    /// Delete one document. Returns false if the id is unknown.
    async fn delete_one(&self, id: &JobId) -> Result<bool>;

    /// Group matching documents by the string at `group_path` and report the
    /// maximum of `max_path` per group, smallest maximum first (groups with no
    /// value at `max_path` lead).
    async fn group_max(
        &self,
        filter: &Filter,
        group_path: &str,
        max_path: &str,
    ) -> Result<Vec<GroupMax>>;
}
