//! Durable dedup backend on an embedded redb database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use super::keyed_lock::KeyedLocks;
use super::Mutexer;
use crate::error::{Error, Result};

/// Processed keys: `"{prefix}:{key}"` -> unix time in milliseconds when marked.
const PROCESSED_TABLE: TableDefinition<&str, u64> = TableDefinition::new("processed_keys");

fn store_err(err: impl Into<redb::Error>) -> Error {
    Error::Store(err.into())
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Keeps processed keys in a redb file, so marks survive restarts.
///
/// Calls for the same key are serialized through a per-key lock; distinct keys
/// proceed in parallel. The key is checked in a read transaction, `f` runs,
/// and the mark is written in its own committed write transaction.
///
/// Two caveats:
/// - Side effects of `f` outside this database are not rolled back.
/// - If `f` succeeds but the mark fails to commit, the error is returned, the
///   message is redelivered and `f` runs again. `f` should tolerate that.
///
/// redb takes an exclusive lock on the file, so exclusivity holds within one
/// process; instances sharing dedup state need a shared store.
pub struct RedbMutexer {
    db: Arc<Database>,
    key_prefix: String,
    retention: Option<Duration>,
    locks: KeyedLocks,
}

impl RedbMutexer {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, key_prefix: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(store_err)?;

        let write_txn = db.begin_write().map_err(store_err)?;
        {
            write_txn.open_table(PROCESSED_TABLE).map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)?;

        info!(path = %path.display(), "Opened dedup store");
        Ok(Self {
            db: Arc::new(db),
            key_prefix: key_prefix.into(),
            retention: None,
            locks: KeyedLocks::new(),
        })
    }

    /// Treat marks older than `retention` as absent.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Whether `key` is currently marked.
    pub async fn is_processed(&self, key: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let full_key = self.full_key(key);
        let retention = self.retention;
        tokio::task::spawn_blocking(move || is_marked(&db, &full_key, retention)).await?
    }

    /// Delete marks older than the retention period. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let db = Arc::clone(&self.db);
        let removed =
            tokio::task::spawn_blocking(move || purge_older_than(&db, retention)).await??;
        if removed > 0 {
            info!(removed, "Purged expired dedup marks");
        }
        Ok(removed)
    }

    async fn mark(&self, full_key: String) -> Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(store_err)?;
            {
                let mut table = write_txn.open_table(PROCESSED_TABLE).map_err(store_err)?;
                table
                    .insert(full_key.as_str(), now_millis())
                    .map_err(store_err)?;
            }
            write_txn.commit().map_err(store_err)
        })
        .await?
    }
}

fn is_marked(db: &Database, full_key: &str, retention: Option<Duration>) -> Result<bool> {
    let read_txn = db.begin_read().map_err(store_err)?;
    let table = read_txn.open_table(PROCESSED_TABLE).map_err(store_err)?;
    let marked_at = match table.get(full_key).map_err(store_err)? {
        Some(value) => value.value(),
        None => return Ok(false),
    };
    Ok(match retention {
        Some(retention) => now_millis().saturating_sub(marked_at) < retention.as_millis() as u64,
        None => true,
    })
}

fn purge_older_than(db: &Database, retention: Duration) -> Result<usize> {
    let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
    let write_txn = db.begin_write().map_err(store_err)?;
    let removed = {
        let mut table = write_txn.open_table(PROCESSED_TABLE).map_err(store_err)?;
        let mut expired = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (key, marked_at) = entry.map_err(store_err)?;
            if marked_at.value() <= cutoff {
                expired.push(key.value().to_string());
            }
        }
        for key in &expired {
            table.remove(key.as_str()).map_err(store_err)?;
        }
        expired.len()
    };
    write_txn.commit().map_err(store_err)?;
    Ok(removed)
}

#[async_trait]
impl Mutexer for RedbMutexer {
    async fn run_exclusive_once(
        &self,
        key: &str,
        f: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        let full_key = self.full_key(key);
        let _guard = self.locks.lock(&full_key).await;

        if self.is_processed(key).await? {
            debug!(key = %full_key, "Key already processed, skipping");
            return Ok(());
        }

        f.await?;

        if let Err(e) = self.mark(full_key.clone()).await {
            warn!(key = %full_key, error = %e, "Processed message but failed to record dedup mark");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::tests::{assert_runs_once, concurrent_calls_run_once, failure_allows_retry};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> RedbMutexer {
        RedbMutexer::open(dir.path().join("dedup.redb"), "test").unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mutexer = open(&dir);
        assert_runs_once(&mutexer, "key").await;
        assert!(mutexer.is_processed("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mutexer = open(&dir);
        failure_allows_retry(&mutexer, "key").await;
    }

    #[tokio::test]
    async fn test_concurrent_same_key() {
        let dir = tempfile::tempdir().unwrap();
        concurrent_calls_run_once(Arc::new(open(&dir))).await;
    }

    #[tokio::test]
    async fn test_marks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mutexer = open(&dir);
            mutexer
                .run_exclusive_once("key", Box::pin(async { Ok(()) }))
                .await
                .unwrap();
        }

        let reopened = open(&dir);
        assert!(reopened.is_processed("key").await.unwrap());
        let result = reopened
            .run_exclusive_once("key", Box::pin(async { Err(anyhow::anyhow!("ran again")) }))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_prefix_namespaces_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.redb");
        {
            let a = RedbMutexer::open(&path, "a").unwrap();
            a.run_exclusive_once("key", Box::pin(async { Ok(()) }))
                .await
                .unwrap();
        }
        let b = RedbMutexer::open(&path, "b").unwrap();
        assert!(!b.is_processed("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_marks_count_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mutexer = open(&dir).with_retention(Duration::from_millis(20));
        mutexer
            .run_exclusive_once("key", Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert!(mutexer.is_processed("key").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!mutexer.is_processed("key").await.unwrap());
        assert_eq!(mutexer.purge_expired().await.unwrap(), 1);
        assert_eq!(mutexer.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_without_retention_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mutexer = open(&dir);
        mutexer
            .run_exclusive_once("key", Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(mutexer.purge_expired().await.unwrap(), 0);
        assert!(mutexer.is_processed("key").await.unwrap());
    }
}
