//! Distributed mutual exclusion over the shared store
//!
//! Locks are a set-if-absent-with-TTL record keyed by the resource
//! identifier and holding a random owner token. Acquire is a single
//! atomic compare-and-set; there is no check-then-write window for two
//! callers to race through. Release deletes the record only if it still
//! holds this owner's token, so a lock that expired and was re-acquired
//! by someone else is never clobbered.
//!
//! A crashed holder is healed by the TTL: once it elapses the record
//! reads as absent and the next acquire wins.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::store::SharedStore;

/// Time-boxed exclusive locks keyed by arbitrary strings.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

/// A held lock. Not released on drop: release is an async store
/// round-trip, and an unreleased lock self-heals via its TTL anyway.
#[must_use = "locks should be released (or allowed to expire) after use"]
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
}

impl LockService {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Try to take the lock for `resource`. Returns `None` when another
    /// holder owns it; expected under concurrent dispatchers, and callers
    /// skip the resource for this tick.
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>> {
        let key = format!("lock:{}", resource);
        let token = Uuid::new_v4().to_string();

        if self.store.set_if_absent(&key, &token, self.ttl).await? {
            debug!(resource, "Lock acquired");
            Ok(Some(LockGuard {
                store: self.store.clone(),
                key,
                token,
            }))
        } else {
            debug!(resource, "Lock contended; skipping");
            Ok(None)
        }
    }
}

impl LockGuard {
    /// Release the lock if this guard still owns it. Returns `false`
    /// when the TTL had already expired and someone else holds it now.
    pub async fn release(self) -> Result<bool> {
        Ok(self.store.delete_if_value(&self.key, &self.token).await?)
    }
}
