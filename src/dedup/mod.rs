//! Effectively-once execution backends.
//!
//! A [`Mutexer`] runs a closure at most once successfully per key. Brokers
//! deliver at least once; pairing a mutexer with a stable dedup key turns
//! redelivery into effectively-once processing.

mod keyed_lock;
mod memory;
mod postgres;
mod redb_store;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use memory::MemoryMutexer;
pub use postgres::PostgresMutexer;
pub use redb_store::RedbMutexer;

use crate::error::{Error, Result};
use crate::types::{DedupBackend, DedupSettings};

/// Runs work at most once successfully per key.
///
/// - If `key` is already marked, `f` is not run and `Ok(())` is returned.
/// - Otherwise `f` runs. The key is marked only if `f` succeeds; on failure
///   nothing is recorded and the error is returned, so a redelivery retries.
/// - Concurrent calls with the same key never both run `f`.
#[async_trait]
pub trait Mutexer: Send + Sync {
    async fn run_exclusive_once(
        &self,
        key: &str,
        f: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<()>;
}

pub type SharedMutexer = Arc<dyn Mutexer>;

/// Build the backend selected in `settings`.
///
/// The postgres backend connects and creates its table before returning.
pub async fn from_settings(settings: &DedupSettings) -> Result<SharedMutexer> {
    let mutexer: SharedMutexer = match settings.backend {
        DedupBackend::Memory => Arc::new(MemoryMutexer::new()),
        DedupBackend::Redb => {
            let mut mutexer = RedbMutexer::open(&settings.path, settings.key_prefix.clone())?;
            if let Some(retention) = settings.retention() {
                mutexer = mutexer.with_retention(retention);
            }
            Arc::new(mutexer)
        }
        DedupBackend::Postgres => {
            let url = settings.database_url.as_deref().ok_or_else(|| {
                Error::Config(::config::ConfigError::NotFound(
                    "dedup.database_url".to_string(),
                ))
            })?;
            let mut mutexer = PostgresMutexer::connect(
                url,
                settings.key_prefix.clone(),
                settings.max_connections,
            )
            .await?;
            if let Some(retention) = settings.retention() {
                mutexer = mutexer.with_retention(retention);
            }
            Arc::new(mutexer)
        }
    };
    Ok(mutexer)
}
