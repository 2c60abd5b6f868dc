//! Error types for the middleware layer.
//!
//! Application handlers return `anyhow::Result<()>`; the variants below are the
//! failures the library itself produces. They flow through handler pipelines
//! unchanged, so outer interceptors observe the real outcome.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias for library operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by subscribers, publishers, the batch scheduler and dedup backends.
#[derive(Debug, Error)]
pub enum Error {
    /// The broker has no subscription with this id.
    #[error("pubsub subscription '{0}' does not exist")]
    SubscriptionNotFound(String),

    /// The broker has no topic with this id.
    #[error("pubsub topic '{0}' does not exist")]
    TopicNotFound(String),

    /// A handler was already registered for the subscription.
    #[error("handler for subscription '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Registration attempted after the subscriber started running.
    #[error("subscriber is already running, cannot register '{0}'")]
    AlreadyRunning(String),

    /// Accepting the message would exceed the scheduler's buffered byte limit.
    #[error("batch buffer is full: {buffered} bytes buffered, {size} more would exceed limit of {limit}")]
    BufferFull {
        buffered: usize,
        size: usize,
        limit: usize,
    },

    /// A single message is larger than the scheduler's buffered byte limit.
    #[error("message of {size} bytes exceeds buffered byte limit of {limit}")]
    OversizedItem { size: usize, limit: usize },

    /// The batch scheduler was shut down.
    #[error("batch scheduler is closed")]
    SchedulerClosed,

    /// A handler panicked and the panic was recovered.
    #[error("recovered from panic while processing message '{message_id}': {panic}")]
    Panicked { message_id: String, panic: String },

    /// A batch handler panicked; every message in the batch fails with this.
    #[error("batch handler panicked while processing {count} messages: {panic}")]
    BatchPanicked { count: usize, panic: String },

    /// The dedup store failed.
    #[error("dedup store error: {0}")]
    Store(#[from] redb::Error),

    /// The shared dedup database failed.
    #[error("dedup database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A blocking store task failed to complete.
    #[error("dedup store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),

    /// The broker client failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// An error shared between several waiters.
///
/// The batch scheduler hands the same failure to every caller whose message
/// was in the failing bundle; `anyhow::Error` is not `Clone`, so the original
/// is kept behind an `Arc` and each caller receives a `SharedError` pointing at it.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// The original error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Wrap into an `anyhow::Error` for returning from a handler.
    pub fn to_anyhow(&self) -> anyhow::Error {
        anyhow::Error::new(self.clone())
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
