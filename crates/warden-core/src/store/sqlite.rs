//! SQLite store backend.
//!
//! A shared database file gives independent OS processes a common
//! coordination point: `BEGIN IMMEDIATE` transactions take the database write
//! lock up front, so each compare-and-act step executes as one atomic unit
//! regardless of how many peer processes race on the same file. Expiry is
//! wall-clock milliseconds since the Unix epoch, reaped lazily inside the
//! same transaction that observes the key.
//!
//! Connections run in WAL mode with a busy timeout; every store call is
//! dispatched through `spawn_blocking` so the async runtime never parks on
//! the database lock.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use super::{checked_key, CoordinationStore, StoreError};

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// SQLite-backed [`CoordinationStore`] implementation.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) the store database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database. Useful for exercising the SQL
    /// paths in tests; it is not shared between store instances.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS warden_kv (
                 key            TEXT PRIMARY KEY,
                 value          TEXT NOT NULL,
                 expires_at_ms  INTEGER
             )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("store task failed: {err}")))?
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Deletes an expired row for `key`, if any, inside the caller's transaction.
fn reap_expired(conn: &Connection, key: &str, now: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "DELETE FROM warden_kv
         WHERE key = ?1 AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?2",
        rusqlite::params![key, now],
    )?;
    Ok(())
}

fn parse_counter(key: &str, value: &str) -> Result<i64, StoreError> {
    value.parse::<i64>().map_err(|_| StoreError::NotACounter {
        key: key.to_string(),
    })
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        let holder = holder_id.to_string();
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, &key, now)?;
            let inserted = tx.execute(
                "INSERT INTO warden_kv (key, value, expires_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                rusqlite::params![key, holder, now + ttl_ms as i64],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        let holder = holder_id.to_string();
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, &key, now)?;
            let deleted = tx.execute(
                "DELETE FROM warden_kv WHERE key = ?1 AND value = ?2",
                rusqlite::params![key, holder],
            )?;
            tx.commit()?;
            Ok(deleted == 1)
        })
        .await
    }

    async fn extend(
        &self,
        key: &str,
        holder_id: &str,
        new_ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        let holder = holder_id.to_string();
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, &key, now)?;
            let updated = tx.execute(
                "UPDATE warden_kv SET expires_at_ms = ?3 WHERE key = ?1 AND value = ?2",
                rusqlite::params![key, holder, now + new_ttl_ms as i64],
            )?;
            tx.commit()?;
            Ok(updated == 1)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        self.run(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM warden_kv
                     WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                    rusqlite::params![key, now_ms()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn incr(&self, key: &str, ttl_ms: u64) -> Result<i64, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, &key, now)?;
            let current = tx
                .query_row(
                    "SELECT value FROM warden_kv WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map_or(Ok(0), |v| parse_counter(&key, &v))?;
            let next = current + 1;
            tx.execute(
                "INSERT INTO warden_kv (key, value, expires_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at_ms = ?3",
                rusqlite::params![key, next.to_string(), now + ttl_ms as i64],
            )?;
            tx.commit()?;
            Ok(next)
        })
        .await
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, &key, now)?;
            let Some(value) = tx
                .query_row(
                    "SELECT value FROM warden_kv WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            else {
                tx.commit()?;
                return Ok(0);
            };
            let next = parse_counter(&key, &value)? - 1;
            if next <= 0 {
                tx.execute(
                    "DELETE FROM warden_kv WHERE key = ?1",
                    rusqlite::params![key],
                )?;
            } else {
                tx.execute(
                    "UPDATE warden_kv SET value = ?2 WHERE key = ?1",
                    rusqlite::params![key, next.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(next.max(0))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        checked_key(key)?;
        let key = key.to_string();
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reap_expired(&tx, &key, now)?;
            let deleted = tx.execute(
                "DELETE FROM warden_kv WHERE key = ?1",
                rusqlite::params![key],
            )?;
            tx.commit()?;
            Ok(deleted == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let store = SqliteStore::in_memory().unwrap();

        assert!(store.try_acquire("lock:a", "holder-1", 10_000).await.unwrap());
        assert!(!store.try_acquire("lock:a", "holder-2", 10_000).await.unwrap());
        assert!(!store.release("lock:a", "holder-2").await.unwrap());
        assert!(store.release("lock:a", "holder-1").await.unwrap());
        assert!(store.try_acquire("lock:a", "holder-2", 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_allows_reacquisition() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.try_acquire("lock:a", "holder-1", 20).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(store.try_acquire("lock:a", "holder-2", 10_000).await.unwrap());
        // Stale holder can no longer release the key it lost.
        assert!(!store.release("lock:a", "holder-1").await.unwrap());
    }

    #[tokio::test]
    async fn counters_round_trip_and_delete_at_zero() {
        let store = SqliteStore::in_memory().unwrap();

        assert_eq!(store.incr("rw:t:readers", 10_000).await.unwrap(), 1);
        assert_eq!(store.incr("rw:t:readers", 10_000).await.unwrap(), 2);
        assert_eq!(store.decr("rw:t:readers").await.unwrap(), 1);
        assert_eq!(store.decr("rw:t:readers").await.unwrap(), 0);
        assert_eq!(store.get("rw:t:readers").await.unwrap(), None);
        assert_eq!(store.decr("rw:t:readers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordination.db");

        let store_a = SqliteStore::open(&path).unwrap();
        assert!(store_a.try_acquire("lock:x", "holder-1", 60_000).await.unwrap());

        // A second client over the same file observes the same lock state,
        // which is what cross-process mutual exclusion rests on.
        let store_b = SqliteStore::open(&path).unwrap();
        assert!(!store_b.try_acquire("lock:x", "holder-2", 60_000).await.unwrap());
        assert_eq!(
            store_b.get("lock:x").await.unwrap().as_deref(),
            Some("holder-1")
        );
    }

    #[tokio::test]
    async fn counter_type_confusion_is_an_error() {
        let store = SqliteStore::in_memory().unwrap();
        store.try_acquire("lock:a", "holder-1", 10_000).await.unwrap();

        assert!(matches!(
            store.incr("lock:a", 10_000).await,
            Err(StoreError::NotACounter { .. })
        ));
    }
}
