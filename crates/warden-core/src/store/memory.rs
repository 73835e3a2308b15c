//! In-process store backend.
//!
//! Backs tests and single-process deployments. All operations run under one
//! mutex, which makes every method trivially atomic; expiry uses monotonic
//! [`Instant`] stamps checked at access time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{checked_key, CoordinationStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-memory [`CoordinationStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the live entry map, purging any expired entry for `key`
    /// first so callers only ever observe live state.
    fn with_state<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        if let Some(entry) = state.get(key) {
            if !entry.is_live(now) {
                state.remove(key);
            }
        }
        f(&mut state, now)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        checked_key(key)?;
        Ok(self.with_state(key, |state, now| {
            if state.contains_key(key) {
                return false;
            }
            state.insert(
                key.to_string(),
                Entry {
                    value: holder_id.to_string(),
                    expires_at: Some(now + Duration::from_millis(ttl_ms)),
                },
            );
            true
        }))
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, StoreError> {
        checked_key(key)?;
        Ok(self.with_state(key, |state, _now| {
            match state.get(key) {
                Some(entry) if entry.value == holder_id => {
                    state.remove(key);
                    true
                }
                _ => false,
            }
        }))
    }

    async fn extend(
        &self,
        key: &str,
        holder_id: &str,
        new_ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        checked_key(key)?;
        Ok(self.with_state(key, |state, now| {
            match state.get_mut(key) {
                Some(entry) if entry.value == holder_id => {
                    entry.expires_at = Some(now + Duration::from_millis(new_ttl_ms));
                    true
                }
                _ => false,
            }
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        checked_key(key)?;
        Ok(self.with_state(key, |state, _now| state.get(key).map(|e| e.value.clone())))
    }

    async fn incr(&self, key: &str, ttl_ms: u64) -> Result<i64, StoreError> {
        checked_key(key)?;
        self.with_state(key, |state, now| {
            let current = match state.get(key) {
                Some(entry) => entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| StoreError::NotACounter {
                        key: key.to_string(),
                    })?,
                None => 0,
            };
            let next = current + 1;
            state.insert(
                key.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at: Some(now + Duration::from_millis(ttl_ms)),
                },
            );
            Ok(next)
        })
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        checked_key(key)?;
        self.with_state(key, |state, _now| {
            let Some(entry) = state.get(key) else {
                return Ok(0);
            };
            let current = entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::NotACounter {
                    key: key.to_string(),
                })?;
            let next = current - 1;
            if next <= 0 {
                state.remove(key);
            } else if let Some(entry) = state.get_mut(key) {
                entry.value = next.to_string();
            }
            Ok(next.max(0))
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        checked_key(key)?;
        Ok(self.with_state(key, |state, _now| state.remove(key).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let store = MemoryStore::new();
        assert!(store.try_acquire("lock:a", "holder-1", 10_000).await.unwrap());
        assert!(!store.try_acquire("lock:a", "holder-2", 10_000).await.unwrap());

        assert!(store.release("lock:a", "holder-1").await.unwrap());
        assert!(store.try_acquire("lock:a", "holder-2", 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let store = MemoryStore::new();
        store.try_acquire("lock:a", "holder-1", 10_000).await.unwrap();

        assert!(!store.release("lock:a", "holder-2").await.unwrap());
        assert_eq!(
            store.get("lock:a").await.unwrap().as_deref(),
            Some("holder-1")
        );
    }

    #[tokio::test]
    async fn expired_entry_is_reacquirable() {
        let store = MemoryStore::new();
        assert!(store.try_acquire("lock:a", "holder-1", 20).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(store.try_acquire("lock:a", "holder-2", 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn extend_refreshes_ttl_for_holder_only() {
        let store = MemoryStore::new();
        store.try_acquire("lock:a", "holder-1", 50).await.unwrap();

        assert!(!store.extend("lock:a", "holder-2", 10_000).await.unwrap());
        assert!(store.extend("lock:a", "holder-1", 10_000).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Still held: the extend outlived the original TTL.
        assert_eq!(
            store.get("lock:a").await.unwrap().as_deref(),
            Some("holder-1")
        );
    }

    #[tokio::test]
    async fn release_after_expiry_is_a_noop() {
        let store = MemoryStore::new();
        store.try_acquire("lock:a", "holder-1", 20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.release("lock:a", "holder-1").await.unwrap());
    }

    #[tokio::test]
    async fn counter_deletes_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("rw:t:readers", 10_000).await.unwrap(), 1);
        assert_eq!(store.incr("rw:t:readers", 10_000).await.unwrap(), 2);
        assert_eq!(store.decr("rw:t:readers").await.unwrap(), 1);
        assert_eq!(store.decr("rw:t:readers").await.unwrap(), 0);

        // Key is gone, not a stored zero.
        assert_eq!(store.get("rw:t:readers").await.unwrap(), None);
        assert_eq!(store.decr("rw:t:readers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_keys() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.try_acquire("bad key", "h", 1000).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("").await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
