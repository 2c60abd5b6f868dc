//! Process-local dedup backend.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use super::Mutexer;

/// Keeps processed keys in memory.
///
/// One lock guards the whole set and is held across check, run and mark, so
/// every call is serialized, even for unrelated keys. Marks are lost on
/// restart. Suitable for tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryMutexer {
    processed: Mutex<HashSet<String>>,
}

impl MemoryMutexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_processed(&self, key: &str) -> bool {
        self.processed.lock().await.contains(key)
    }
}

#[async_trait]
impl Mutexer for MemoryMutexer {
    async fn run_exclusive_once(
        &self,
        key: &str,
        f: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        let mut processed = self.processed.lock().await;
        if processed.contains(key) {
            debug!(key, "Key already processed, skipping");
            return Ok(());
        }

        f.await?;
        processed.insert(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::tests::{assert_runs_once, concurrent_calls_run_once, failure_allows_retry};

    #[tokio::test]
    async fn test_duplicate_is_skipped() {
        let mutexer = MemoryMutexer::new();
        assert_runs_once(&mutexer, "key").await;
        assert!(mutexer.is_processed("key").await);
    }

    #[tokio::test]
    async fn test_failure_allows_retry() {
        let mutexer = MemoryMutexer::new();
        failure_allows_retry(&mutexer, "key").await;
    }

    #[tokio::test]
    async fn test_concurrent_same_key() {
        concurrent_calls_run_once(std::sync::Arc::new(MemoryMutexer::new())).await;
    }
}
