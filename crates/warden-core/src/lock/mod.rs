//! Distributed lock manager.
//!
//! Builds exclusive and read/write locks on top of the coordination store.
//! At most one holder owns an exclusive lock on a resource at any instant;
//! ownership is proven by an opaque holder id that the store compares before
//! every release or extension, so a lock that expired and was re-acquired by
//! a different holder can never be touched by the original one.
//!
//! Lock state lives only in the store. The manager caches nothing across
//! calls; a [`LockToken`] is a receipt, not a cache.
//!
//! # Token lifecycle
//!
//! A token starts implicitly unacquired, becomes `Held` on successful
//! acquisition, and ends in one of two terminal states:
//!
//! ```text
//! (unacquired) --acquire--> Held --release--> Released
//!                            |  \--extend--> Held
//!                            \--TTL elapses--> Expired
//! ```
//!
//! No transition leaves `Released` or `Expired`.

mod rwlock;

pub use rwlock::ReadToken;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::store::{CoordinationStore, StoreError};
use crate::validate::{self, ValidationError};

/// Key prefix for exclusive locks.
const EXCLUSIVE_PREFIX: &str = "warden:lock:";

/// Errors from lock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The acquisition deadline elapsed without obtaining the lock.
    #[error("timed out acquiring lock on {resource} after {waited_ms}ms")]
    Timeout {
        /// The contested resource.
        resource: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A write lock was requested while readers are active. Not retried
    /// internally; callers own their backoff policy.
    #[error("write lock on {resource} blocked by {readers} active reader(s)")]
    WriteBlockedByReaders {
        /// The contested resource.
        resource: String,
        /// Observed reader count.
        readers: i64,
    },

    /// A read lock was requested while a write lock is held.
    #[error("read lock on {resource} blocked by an active writer")]
    ReadBlockedByWriter {
        /// The contested resource.
        resource: String,
    },

    /// The token is not in the `Held` state.
    #[error("lock token for {resource} is not held (state: {state})")]
    NotHeld {
        /// The token's resource.
        resource: String,
        /// The token's current state.
        state: TokenState,
    },

    /// The lock expired (and may have been re-acquired elsewhere) before the
    /// operation could complete.
    #[error("lock on {resource} expired before the operation completed")]
    Expired {
        /// The token's resource.
        resource: String,
    },

    /// The resource name failed validation.
    #[error(transparent)]
    InvalidResource(#[from] ValidationError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Observable state of a lock token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// The holder owns the lock.
    Held,
    /// The holder released the lock. Terminal.
    Released,
    /// The TTL elapsed without renewal. Terminal.
    Expired,
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Held => write!(f, "held"),
            Self::Released => write!(f, "released"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Receipt for an acquired exclusive (or write) lock.
///
/// The embedded holder id is the only credential that can release or extend
/// the underlying store entry.
#[derive(Debug)]
pub struct LockToken {
    resource: String,
    key: String,
    holder_id: String,
    acquired_at_ms: u64,
    ttl_ms: u64,
    state: TokenState,
}

impl LockToken {
    /// The resource this token locks.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The opaque holder id proving ownership.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquisition timestamp, milliseconds since the Unix epoch.
    #[must_use]
    pub const fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }

    /// TTL granted at acquisition or by the most recent extension.
    #[must_use]
    pub const fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Current token state.
    #[must_use]
    pub const fn state(&self) -> TokenState {
        self.state
    }
}

/// Manager for distributed locks over a shared [`CoordinationStore`].
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    config: LockConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Creates a lock manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub(crate) fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub(crate) const fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquires the exclusive lock on `resource` with the given TTL, waiting
    /// up to the configured `lock_timeout_ms`.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` when the deadline elapses, or propagates
    /// validation/store failures.
    pub async fn acquire(&self, resource: &str, ttl_ms: u64) -> Result<LockToken, LockError> {
        self.acquire_with_timeout(
            resource,
            ttl_ms,
            Duration::from_millis(self.config.lock_timeout_ms),
        )
        .await
    }

    /// Acquires the exclusive lock on `resource`, waiting up to a
    /// caller-supplied deadline instead of the configured one.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` when `timeout` elapses, or propagates
    /// validation/store failures.
    pub async fn acquire_with_timeout(
        &self,
        resource: &str,
        ttl_ms: u64,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        validate::validate_key(resource)?;
        let key = format!("{EXCLUSIVE_PREFIX}{resource}");
        self.acquire_key(resource, &key, ttl_ms, timeout).await
    }

    /// Acquisition retry loop shared by exclusive, write, and guard locks.
    /// The wait between attempts suspends the task; it never spins.
    pub(crate) async fn acquire_key(
        &self,
        resource: &str,
        key: &str,
        ttl_ms: u64,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let holder_id = Uuid::new_v4().to_string();
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let started = Instant::now();

        loop {
            if self.store.try_acquire(key, &holder_id, ttl_ms).await? {
                debug!(resource, holder_id = %holder_id, ttl_ms, "lock acquired");
                return Ok(LockToken {
                    resource: resource.to_string(),
                    key: key.to_string(),
                    holder_id,
                    acquired_at_ms: epoch_ms(),
                    ttl_ms,
                    state: TokenState::Held,
                });
            }

            if started.elapsed() + retry_delay > timeout {
                let waited_ms = started.elapsed().as_millis() as u64;
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited_ms,
                });
            }
            tokio::time::sleep(retry_delay).await;
        }
    }

    /// Releases a held token. Idempotent: releasing an already-released or
    /// expired token returns `false` and never touches another holder's
    /// entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures only; a lost or expired token is reported
    /// through the `false` return, not an error.
    pub async fn release(&self, token: &mut LockToken) -> Result<bool, LockError> {
        if token.state != TokenState::Held {
            debug!(
                resource = %token.resource,
                state = %token.state,
                "release on non-held token is a no-op"
            );
            return Ok(false);
        }

        let released = self.store.release(&token.key, &token.holder_id).await?;
        if released {
            token.state = TokenState::Released;
        } else {
            // The entry expired (and possibly changed hands) underneath us.
            warn!(
                resource = %token.resource,
                holder_id = %token.holder_id,
                "lock already expired at release"
            );
            token.state = TokenState::Expired;
        }
        Ok(released)
    }

    /// Renews a held token without releasing it.
    ///
    /// # Errors
    ///
    /// Returns `LockError::NotHeld` for tokens in a terminal state and
    /// `LockError::Expired` when the store entry no longer belongs to this
    /// holder.
    pub async fn extend(&self, token: &mut LockToken, new_ttl_ms: u64) -> Result<(), LockError> {
        if token.state != TokenState::Held {
            return Err(LockError::NotHeld {
                resource: token.resource.clone(),
                state: token.state,
            });
        }

        if self
            .store
            .extend(&token.key, &token.holder_id, new_ttl_ms)
            .await?
        {
            token.ttl_ms = new_ttl_ms;
            Ok(())
        } else {
            token.state = TokenState::Expired;
            Err(LockError::Expired {
                resource: token.resource.clone(),
            })
        }
    }

    /// Runs `op` while holding the exclusive lock on `resource`, releasing on
    /// every exit path. If the holder crashes instead, the TTL reclaims the
    /// lock.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors; `op`'s own result is returned untouched.
    /// Release failures are logged and swallowed per the idempotent-release
    /// contract.
    pub async fn with_exclusive<T, F, Fut>(
        &self,
        resource: &str,
        ttl_ms: u64,
        op: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let mut token = self.acquire(resource, ttl_ms).await?;
        let result = op().await;
        if let Err(err) = self.release(&mut token).await {
            warn!(resource, error = %err, "failed to release scoped lock");
        }
        Ok(result)
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::store::MemoryStore;

    use super::*;

    fn manager() -> LockManager {
        manager_with(LockConfig::default())
    }

    fn manager_with(config: LockConfig) -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn concurrent_acquire_grants_exactly_one_token() {
        let manager = Arc::new(manager_with(LockConfig {
            lock_timeout_ms: 200,
            retry_delay_ms: 20,
            ..LockConfig::default()
        }));

        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire("file-X", 10_000).await })
        };
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire("file-X", 10_000).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let timed_out = results
            .iter()
            .filter(|r| matches!(r, Err(LockError::Timeout { .. })))
            .count();

        assert_eq!(granted, 1);
        assert_eq!(timed_out, 1);
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let manager = Arc::new(manager_with(LockConfig {
            lock_timeout_ms: 2_000,
            retry_delay_ms: 10,
            ..LockConfig::default()
        }));

        let mut token = manager.acquire("file-X", 10_000).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire("file-X", 10_000).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.release(&mut token).await.unwrap());

        let token_b = waiter.await.unwrap().unwrap();
        assert_eq!(token_b.state(), TokenState::Held);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = manager();
        let mut token = manager.acquire("file-X", 10_000).await.unwrap();

        assert!(manager.release(&mut token).await.unwrap());
        assert_eq!(token.state(), TokenState::Released);

        // Second release: no-op, no error.
        assert!(!manager.release(&mut token).await.unwrap());
        assert_eq!(token.state(), TokenState::Released);
    }

    #[tokio::test]
    async fn release_after_expiry_reports_false_and_spares_new_holder() {
        let manager = manager();
        let mut stale = manager.acquire("file-X", 20).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = manager.acquire("file-X", 10_000).await.unwrap();

        assert!(!manager.release(&mut stale).await.unwrap());
        assert_eq!(stale.state(), TokenState::Expired);

        // The new holder's entry is untouched.
        assert_eq!(
            manager
                .store()
                .get("warden:lock:file-X")
                .await
                .unwrap()
                .as_deref(),
            Some(fresh.holder_id())
        );
    }

    #[tokio::test]
    async fn extend_keeps_token_held() {
        let manager = manager();
        let mut token = manager.acquire("file-X", 60).await.unwrap();

        manager.extend(&mut token, 10_000).await.unwrap();
        assert_eq!(token.state(), TokenState::Held);
        assert_eq!(token.ttl_ms(), 10_000);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Outlived the original TTL thanks to the extension.
        assert!(manager.release(&mut token).await.unwrap());
    }

    #[tokio::test]
    async fn extend_of_expired_token_fails_terminally() {
        let manager = manager();
        let mut token = manager.acquire("file-X", 20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = manager.extend(&mut token, 10_000).await.unwrap_err();
        assert!(matches!(err, LockError::Expired { .. }));
        assert_eq!(token.state(), TokenState::Expired);

        // Terminal: a further extend reports NotHeld, not Expired again.
        let err = manager.extend(&mut token, 10_000).await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld { .. }));
    }

    #[tokio::test]
    async fn with_exclusive_releases_on_success_and_error() {
        let manager = manager();
        let calls = AtomicU32::new(0);

        let out: Result<(), &str> = manager
            .with_exclusive("file-X", 10_000, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("payload failed")
            })
            .await
            .unwrap();
        assert!(out.is_err());

        // Lock is free again even though the payload failed.
        let token = manager.acquire("file-X", 10_000).await.unwrap();
        assert_eq!(token.state(), TokenState::Held);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_resource_names() {
        let manager = manager();
        assert!(matches!(
            manager.acquire("../escape", 1_000).await,
            Err(LockError::InvalidResource(_))
        ));
    }
}
