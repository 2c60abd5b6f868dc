//! Shared dedup backend on PostgreSQL.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use super::Mutexer;
use crate::error::{Error, Result};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pubsub_dedup_keys (
    key TEXT PRIMARY KEY,
    marked_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Inserts the mark, or refreshes one older than the retention period.
/// Affects no row when a live mark exists. A concurrent claim of the same key
/// blocks on the row until the other transaction ends.
const CLAIM_KEY: &str = r#"
INSERT INTO pubsub_dedup_keys (key) VALUES ($1)
ON CONFLICT (key) DO UPDATE SET marked_at = now()
WHERE $2::float8 IS NOT NULL
  AND pubsub_dedup_keys.marked_at < now() - make_interval(secs => $2::float8)
"#;

const IS_MARKED: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM pubsub_dedup_keys
    WHERE key = $1
      AND ($2::float8 IS NULL OR marked_at >= now() - make_interval(secs => $2::float8))
)
"#;

const PURGE_OLDER_THAN: &str = r#"
DELETE FROM pubsub_dedup_keys
WHERE marked_at < now() - make_interval(secs => $1::float8)
"#;

/// Keeps processed keys in a PostgreSQL table shared by every instance.
///
/// Claiming the key, running `f` and committing the mark happen in one
/// transaction. The claim's row lock serializes calls for the same key across
/// processes; if `f` fails the transaction rolls back and the key stays
/// unmarked. Side effects of `f` outside the database are not rolled back.
///
/// Each in-flight call holds a pooled connection while `f` runs, so the pool
/// size bounds how many messages are processed at once.
pub struct PostgresMutexer {
    pool: PgPool,
    key_prefix: String,
    retention: Option<Duration>,
}

impl PostgresMutexer {
    /// Wrap an existing pool. The table must exist; see [`ensure_schema`](Self::ensure_schema).
    pub fn new(pool: PgPool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            retention: None,
        }
    }

    /// Connect to `database_url` and create the table if needed.
    pub async fn connect(
        database_url: &str,
        key_prefix: impl Into<String>,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        let mutexer = Self::new(pool, key_prefix);
        mutexer.ensure_schema().await?;
        info!(max_connections, "Connected dedup store to PostgreSQL");
        Ok(mutexer)
    }

    /// Treat marks older than `retention` as absent.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    fn retention_secs(&self) -> Option<f64> {
        self.retention.map(|r| r.as_secs_f64())
    }

    /// Whether `key` is currently marked.
    pub async fn is_processed(&self, key: &str) -> Result<bool> {
        let marked = sqlx::query_scalar::<_, bool>(IS_MARKED)
            .bind(self.full_key(key))
            .bind(self.retention_secs())
            .fetch_one(&self.pool)
            .await?;
        Ok(marked)
    }

    /// Delete marks older than the retention period. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let Some(secs) = self.retention_secs() else {
            return Ok(0);
        };
        let removed = sqlx::query(PURGE_OLDER_THAN)
            .bind(secs)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            info!(removed, "Purged expired dedup marks");
        }
        Ok(removed)
    }
}

#[async_trait]
impl Mutexer for PostgresMutexer {
    async fn run_exclusive_once(
        &self,
        key: &str,
        f: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        let full_key = self.full_key(key);
        let mut tx = self.pool.begin().await.map_err(Error::from)?;

        let claimed = sqlx::query(CLAIM_KEY)
            .bind(&full_key)
            .bind(self.retention_secs())
            .execute(&mut *tx)
            .await
            .map_err(Error::from)?
            .rows_affected();
        if claimed == 0 {
            debug!(key = %full_key, "Key already processed, skipping");
            tx.rollback().await.map_err(Error::from)?;
            return Ok(());
        }

        if let Err(e) = f.await {
            if let Err(rollback) = tx.rollback().await {
                warn!(key = %full_key, error = %rollback, "Failed to roll back dedup claim");
            }
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            warn!(key = %full_key, error = %e, "Processed message but failed to record dedup mark");
            return Err(Error::from(e).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::tests::{assert_runs_once, concurrent_calls_run_once, failure_allows_retry};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Connects to `PUBSUB_TEST_DATABASE_URL`; tests needing a server return
    /// early when it is unset.
    async fn shared_store() -> Option<PostgresMutexer> {
        let url = std::env::var("PUBSUB_TEST_DATABASE_URL").ok()?;
        let prefix = format!("test-{}", uuid::Uuid::new_v4());
        Some(PostgresMutexer::connect(&url, prefix, 20).await.unwrap())
    }

    fn unreachable_store() -> PostgresMutexer {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(500))
            .connect_lazy("postgres://pubsub@127.0.0.1:1/pubsub")
            .unwrap();
        PostgresMutexer::new(pool, "test")
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_without_running() {
        let mutexer = unreachable_store();
        let ran = AtomicBool::new(false);
        let err = mutexer
            .run_exclusive_once(
                "key",
                Box::pin(async {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Database(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://pubsub@127.0.0.1:1/pubsub")
            .unwrap();
        let mutexer = PostgresMutexer::new(pool, "orders").with_retention(Duration::from_millis(1500));
        assert_eq!(mutexer.full_key("42"), "orders:42");
        assert_eq!(mutexer.retention_secs(), Some(1.5));
    }

    #[tokio::test]
    async fn test_duplicate_is_skipped() {
        let Some(mutexer) = shared_store().await else {
            return;
        };
        assert_runs_once(&mutexer, "key").await;
        assert!(mutexer.is_processed("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_allows_retry() {
        let Some(mutexer) = shared_store().await else {
            return;
        };
        failure_allows_retry(&mutexer, "key").await;
    }

    #[tokio::test]
    async fn test_concurrent_same_key() {
        let Some(mutexer) = shared_store().await else {
            return;
        };
        concurrent_calls_run_once(Arc::new(mutexer)).await;
    }

    #[tokio::test]
    async fn test_instances_share_marks() {
        let Some(first) = shared_store().await else {
            return;
        };
        let url = std::env::var("PUBSUB_TEST_DATABASE_URL").unwrap();
        let second = PostgresMutexer::connect(&url, first.key_prefix.clone(), 5)
            .await
            .unwrap();

        first
            .run_exclusive_once("key", Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        let result = second
            .run_exclusive_once("key", Box::pin(async { Err(anyhow::anyhow!("ran again")) }))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_expired_marks_count_as_absent() {
        let Some(mutexer) = shared_store().await else {
            return;
        };
        let mutexer = mutexer.with_retention(Duration::from_millis(200));
        mutexer
            .run_exclusive_once("key", Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert!(mutexer.is_processed("key").await.unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!mutexer.is_processed("key").await.unwrap());
        assert!(mutexer.purge_expired().await.unwrap() >= 1);
    }
}
