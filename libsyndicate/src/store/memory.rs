//! In-memory store for tests and single-process deployments

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::SharedStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ListEntry {
    item: String,
    /// When the item becomes eligible for a move out of this list
    available_at: DateTime<Utc>,
    /// When the item entered this list
    added_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Record>,
    lists: HashMap<String, Vec<ListEntry>>,
}

/// Single-process [`SharedStore`] backed by hash maps behind one mutex.
///
/// All operations are atomic because they hold the mutex for their full
/// duration. Expiry is evaluated lazily on read.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ttl_to_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn put_record(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: ttl_to_expiry(ttl),
            },
        );
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.records.get(key) {
            Some(record) if record.expires_at > Utc::now() => Ok(Some(record.value.clone())),
            Some(_) => {
                inner.records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.remove(key);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let occupied = matches!(inner.records.get(key), Some(r) if r.expires_at > now);
        if occupied {
            return Ok(false);
        }
        inner.records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: ttl_to_expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let matches = matches!(inner.records.get(key), Some(r) if r.value == value);
        if matches {
            inner.records.remove(key);
        }
        Ok(matches)
    }

    async fn list_push(
        &self,
        list: &str,
        item: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.lists.entry(list.to_string()).or_default().push(ListEntry {
            item: item.to_string(),
            available_at,
            added_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_move_first(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let entry = match inner.lists.get_mut(src) {
            Some(entries) => {
                match entries.iter().position(|e| e.available_at <= now) {
                    Some(idx) => entries.remove(idx),
                    None => return Ok(None),
                }
            }
            None => return Ok(None),
        };

        let item = entry.item.clone();
        inner.lists.entry(dst.to_string()).or_default().push(ListEntry {
            item: entry.item,
            available_at: now,
            added_at: now,
        });
        Ok(Some(item))
    }

    async fn list_move_item(
        &self,
        src: &str,
        dst: &str,
        item: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;

        let entry = match inner.lists.get_mut(src) {
            Some(entries) => match entries.iter().position(|e| e.item == item) {
                Some(idx) => entries.remove(idx),
                None => return Ok(false),
            },
            None => return Ok(false),
        };

        inner.lists.entry(dst.to_string()).or_default().push(ListEntry {
            item: entry.item,
            available_at,
            added_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_remove(&self, list: &str, item: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(entries) = inner.lists.get_mut(list) {
            if let Some(idx) = entries.iter().position(|e| e.item == item) {
                entries.remove(idx);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_len(&self, list: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(list).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_older_than(
        &self,
        list: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(list)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.added_at < cutoff)
                    .map(|e| e.item.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_items(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(list)
            .map(|entries| entries.iter().map(|e| e.item.clone()).collect())
            .unwrap_or_default())
    }
}
