//! Read/write locks.
//!
//! Readers share a resource; writers exclude everyone. Three store keys per
//! resource carry the state:
//!
//! - `warden:rw:{resource}:write` — the exclusive write lock
//! - `warden:rw:{resource}:readers` — live reader count
//! - `warden:rw:{resource}:guard` — short-TTL helper lock that serializes
//!   every check-and-act on the other two keys
//!
//! Both sides take the guard before deciding: a reader checks for a writer
//! and increments the count under it; a writer checks the count and claims
//! the write key under it. That is what makes the invariant hold for any
//! single observer of the store: a write lock and a positive reader count are
//! never visible at the same instant.
//!
//! Writers fail fast with [`LockError::WriteBlockedByReaders`] instead of
//! queueing; callers decide whether and how to back off.
//!
//! Known race, preserved deliberately: if the store fails over while a
//! reader holds the guard, the guard TTL can expire mid-increment and admit a
//! second mutator, losing an increment. The guard TTL is kept short to bound
//! the window; fixing it outright would need consistency guarantees the
//! store interface does not promise.

use std::time::Duration;

use tracing::debug;

use super::{LockError, LockManager, LockToken};
use crate::validate;

fn write_key(resource: &str) -> String {
    format!("warden:rw:{resource}:write")
}

fn readers_key(resource: &str) -> String {
    format!("warden:rw:{resource}:readers")
}

fn guard_key(resource: &str) -> String {
    format!("warden:rw:{resource}:guard")
}

/// Receipt for a shared read lock. Readers share one logical lock identity;
/// each token represents a single increment of the reader count.
#[derive(Debug)]
pub struct ReadToken {
    resource: String,
    released: bool,
}

impl ReadToken {
    /// The resource this token reads.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl LockManager {
    /// Acquires a shared read lock on `resource`. Readers never block other
    /// readers; the short guard acquisition is the only serialization point.
    ///
    /// # Errors
    ///
    /// Returns `LockError::ReadBlockedByWriter` while a write lock is held,
    /// `LockError::Timeout` if the guard stays contested past the configured
    /// deadline, or a store failure.
    pub async fn acquire_read(&self, resource: &str) -> Result<ReadToken, LockError> {
        validate::validate_key(resource)?;
        let mut guard = self.acquire_guard(resource).await?;

        let outcome = self.try_admit_reader(resource).await;
        self.drop_guard(&mut guard).await;
        let readers = outcome?;

        debug!(resource, readers, "read lock acquired");
        Ok(ReadToken {
            resource: resource.to_string(),
            released: false,
        })
    }

    async fn try_admit_reader(&self, resource: &str) -> Result<i64, LockError> {
        if self.store().get(&write_key(resource)).await?.is_some() {
            return Err(LockError::ReadBlockedByWriter {
                resource: resource.to_string(),
            });
        }
        let readers = self
            .store()
            .incr(&readers_key(resource), self.config().default_ttl_ms)
            .await?;
        Ok(readers)
    }

    /// Releases a read token, decrementing the reader count. The store
    /// deletes the counter key once it reaches zero, so idle resources leave
    /// no key behind.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Releasing the same token twice is a no-op
    /// returning the current count.
    pub async fn release_read(&self, token: &mut ReadToken) -> Result<i64, LockError> {
        if token.released {
            let current = self
                .store()
                .get(&readers_key(&token.resource))
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            return Ok(current);
        }
        token.released = true;
        let remaining = self.store().decr(&readers_key(&token.resource)).await?;
        debug!(resource = %token.resource, remaining, "read lock released");
        Ok(remaining)
    }

    /// Acquires the write lock on `resource` with the given TTL.
    ///
    /// Fails immediately while any reader is active — no queueing, no blind
    /// retry — so a stream of readers cannot silently starve a writer that
    /// believes it is making progress. Contention with another *writer* is
    /// ordinary exclusive-lock contention and is retried with the configured
    /// backoff up to the acquisition deadline. The guard is dropped before
    /// every wait so readers are never starved by a waiting writer.
    ///
    /// # Errors
    ///
    /// Returns `LockError::WriteBlockedByReaders` when the reader count is
    /// positive, `LockError::Timeout` when another writer holds the lock past
    /// the deadline, or a store failure.
    pub async fn acquire_write(&self, resource: &str, ttl_ms: u64) -> Result<LockToken, LockError> {
        validate::validate_key(resource)?;
        let retry_delay = Duration::from_millis(self.config().retry_delay_ms);
        let timeout = Duration::from_millis(self.config().lock_timeout_ms);
        let started = std::time::Instant::now();

        loop {
            let mut guard = self.acquire_guard(resource).await?;
            let outcome = self.try_claim_writer(resource, ttl_ms).await;
            self.drop_guard(&mut guard).await;

            match outcome {
                Err(LockError::Timeout { .. }) => {
                    if started.elapsed() + retry_delay > timeout {
                        return Err(LockError::Timeout {
                            resource: resource.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(retry_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn try_claim_writer(
        &self,
        resource: &str,
        ttl_ms: u64,
    ) -> Result<LockToken, LockError> {
        let readers = self
            .store()
            .get(&readers_key(resource))
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if readers > 0 {
            return Err(LockError::WriteBlockedByReaders {
                resource: resource.to_string(),
                readers,
            });
        }

        // Claim the write key without waiting: the guard already serializes
        // us against readers, and a held write key means a live writer.
        self.acquire_key(
            resource,
            &write_key(resource),
            ttl_ms,
            Duration::from_millis(0),
        )
        .await
    }

    /// Serializes check-and-act sequences on the read/write keys.
    async fn acquire_guard(&self, resource: &str) -> Result<LockToken, LockError> {
        self.acquire_key(
            resource,
            &guard_key(resource),
            self.config().guard_ttl_ms,
            Duration::from_millis(self.config().lock_timeout_ms),
        )
        .await
    }

    async fn drop_guard(&self, guard: &mut LockToken) {
        if let Err(err) = self.release(guard).await {
            tracing::warn!(resource = %guard.resource(), error = %err, "failed to release rw guard");
        }
    }
}
