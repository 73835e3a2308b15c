//! Coordination store client.
//!
//! The store is the single source of truth for lock state across processes.
//! This module defines the small atomic vocabulary every backend must honor:
//!
//! - `try_acquire` — set-if-absent with expiry; no side effect on failure
//! - `release` / `extend` — compare the stored value to the caller's holder
//!   id, then act, as one atomic step
//! - `incr` / `decr` — atomic counters with TTL refresh, deleted at zero
//!
//! The compare-and-act operations are what make cross-owner release
//! impossible: a concurrent expiry-and-reacquire race can never cause holder
//! A to release or extend a key now owned by holder B, because the stored
//! value no longer equals A's holder id.
//!
//! Expired entries are reaped lazily inside the same atomic step that
//! observes them; no backend runs a background sweeper.
//!
//! Two backends ship with the crate: [`MemoryStore`] for tests and
//! single-process deployments, and [`SqliteStore`], where a shared database
//! file and `BEGIN IMMEDIATE` transactions provide genuine cross-process
//! atomicity.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::validate::{self, ValidationError};

/// Errors from coordination store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The key failed validation before reaching the backend.
    #[error(transparent)]
    InvalidKey(#[from] ValidationError),

    /// The backend rejected or failed the operation.
    #[error("store backend failure: {0}")]
    Backend(String),

    /// A counter operation found a non-numeric value at the key.
    #[error("key {key} holds a non-numeric value")]
    NotACounter {
        /// The offending key.
        key: String,
    },
}

/// Atomic key-value operations against the shared coordination store.
///
/// All operations take validated, namespaced keys; implementations call
/// [`checked_key`] on entry so an unvalidated key can never reach backend
/// storage.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically sets `key` to `holder_id` with a TTL if, and only if, no
    /// live value exists at `key`. Returns `false` without side effect when
    /// the key is already held.
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl_ms: u64)
        -> Result<bool, StoreError>;

    /// Atomically deletes `key` if its stored value equals `holder_id`.
    /// Returns `false` when the key is absent, expired, or held by someone
    /// else.
    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, StoreError>;

    /// Atomically resets the TTL of `key` if its stored value equals
    /// `holder_id`. Returns `false` when the key is absent, expired, or held
    /// by someone else.
    async fn extend(&self, key: &str, holder_id: &str, new_ttl_ms: u64)
        -> Result<bool, StoreError>;

    /// Returns the live value at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically increments the counter at `key`, refreshing its TTL, and
    /// returns the new value. A missing or expired key counts from zero.
    async fn incr(&self, key: &str, ttl_ms: u64) -> Result<i64, StoreError>;

    /// Atomically decrements the counter at `key` and returns the new value.
    /// The key is deleted once the counter reaches zero so counter keys never
    /// leak. Decrementing a missing key returns zero and stores nothing.
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// Unconditionally deletes `key`. Returns whether a live value existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Validates a key before it reaches backend storage.
///
/// # Errors
///
/// Returns `StoreError::InvalidKey` when the key fails [`validate::validate_key`].
pub(crate) fn checked_key(key: &str) -> Result<(), StoreError> {
    validate::validate_key(key)?;
    Ok(())
}
