//! Namespace dedication: one worker owns a whole partition of jobs at a time.
//!
//! A worker picks a namespace from a [`NamespaceCandidates`] source, takes the
//! namespace's entry in a [`NamespaceLock`] service and then only claims jobs
//! from that namespace. When a claim comes back empty the entry is deleted
//! and the worker picks again on its next tick, so no worker sits on a
//! namespace longer than it takes to drain it (or for the lock TTL, if it
//! dies first).

pub mod candidates;
pub mod dedication;
pub mod lock;

pub use candidates::{NamespaceCandidates, StoreNamespaceCandidates};
pub use dedication::{Acquisition, NamespaceDedication};
pub use lock::{MemoryNamespaceLock, NamespaceLock};
pub use crate::store::SqliteNamespaceLock;
