//! Shared key/list store backing the job queue and the distributed lock
//!
//! The pipeline never talks to a database directly; everything durable goes
//! through [`SharedStore`], which exposes exactly the primitives the queue
//! and lock need: TTL-bounded records, atomic list moves, and
//! set-if-absent-with-expiry. Two implementations are provided:
//!
//! - [`MemoryStore`]: single-process, used by tests and embedded setups.
//! - [`SqliteStore`]: durable, shared between the daemon and operator
//!   tooling.
//!
//! Every mutation is atomic from the caller's point of view. In particular
//! [`SharedStore::list_move_first`] is the only way an item travels between
//! the ready list and the in-flight list, so an identifier is never visible
//! in two lists at once and never lost between them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::StoreError;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Atomic key/list primitives shared by the queue and the lock service.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Store a record under `key` with a time-to-live, overwriting any
    /// previous value.
    async fn put_record(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Fetch a record. Expired records read as absent.
    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a record. Idempotent.
    async fn delete_record(&self, key: &str) -> Result<(), StoreError>;

    /// Set `key` to `value` with a TTL only if the key is absent (or its
    /// previous value has expired). Returns `true` when the write won.
    ///
    /// This is the lock-acquire primitive: a compare-and-set, not a
    /// check-then-write.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `value`. Returns `true`
    /// when a deletion happened. Lock release uses this so an expired
    /// lock re-acquired by someone else is never clobbered.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Append `item` to the named list. The item only becomes eligible
    /// for [`list_move_first`](Self::list_move_first) once `available_at`
    /// has passed, which is how delayed retries are parked.
    async fn list_push(
        &self,
        list: &str,
        item: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomically move the oldest available item from `src` to `dst` and
    /// return it. The moved item is stamped with the current time in
    /// `dst`, so stale in-flight markers can be found later.
    async fn list_move_first(&self, src: &str, dst: &str)
        -> Result<Option<String>, StoreError>;

    /// Atomically move a specific item from `src` to `dst`, parking it
    /// until `available_at`. Returns `false` if the item was not in
    /// `src` (e.g. a concurrent sweeper already moved it), in which case
    /// `dst` is untouched.
    async fn list_move_item(
        &self,
        src: &str,
        dst: &str,
        item: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Remove a specific item from a list. Returns `true` if it was
    /// present. Idempotent.
    async fn list_remove(&self, list: &str, item: &str) -> Result<bool, StoreError>;

    /// Number of items currently in the list (including not-yet-available
    /// delayed items).
    async fn list_len(&self, list: &str) -> Result<u64, StoreError>;

    /// Items whose stamp in this list is older than `cutoff`, oldest
    /// first. Used by the stale in-flight sweep.
    async fn list_older_than(
        &self,
        list: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// All items in the list, oldest first. Operator inspection only.
    async fn list_items(&self, list: &str) -> Result<Vec<String>, StoreError>;
}
