//! Batch handler trait and the per-message adapter over the scheduler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::scheduler::BatchScheduler;
use crate::chain::{MessageHandler, SharedHandler};
use crate::types::{BatchMessageHandlerConfig, DeliveryContext, Message};

/// Processes a batch of messages.
///
/// Return `Ok(())` to succeed every message, a [`BatchError`](super::BatchError)
/// to fail specific messages by id, or any other error to fail the whole batch.
#[async_trait]
pub trait MessageBatchHandler: Send + Sync {
    async fn handle_batch(&self, messages: Vec<Message>) -> anyhow::Result<()>;
}

pub type SharedBatchHandler = Arc<dyn MessageBatchHandler>;

/// Batch handler backed by a closure. Created by [`batch_handler_fn`].
pub struct BatchHandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageBatchHandler for BatchHandlerFn<F>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle_batch(&self, messages: Vec<Message>) -> anyhow::Result<()> {
        (self.f)(messages).await
    }
}

pub fn batch_handler_fn<F, Fut>(f: F) -> SharedBatchHandler
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(BatchHandlerFn { f })
}

/// A [`MessageHandler`] that groups messages into batches.
///
/// Each call to `handle` enqueues the message and resolves once the batch
/// containing it has been processed, with that message's own outcome. It can
/// therefore sit at the end of an interceptor chain like any other handler.
#[derive(Clone)]
pub struct BatchingHandler {
    scheduler: BatchScheduler,
}

impl BatchingHandler {
    pub fn new(handler: SharedBatchHandler, config: BatchMessageHandlerConfig) -> Self {
        Self {
            scheduler: BatchScheduler::new(handler, config),
        }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Flush buffered messages and wait for in-flight batches.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

#[async_trait]
impl MessageHandler for BatchingHandler {
    async fn handle(&self, _ctx: DeliveryContext, msg: Message) -> anyhow::Result<()> {
        self.scheduler.submit(msg).await
    }
}

/// Wrap a batch handler as a per-message handler. Zero config fields take defaults.
pub fn new_batch_message_handler(
    handler: SharedBatchHandler,
    config: BatchMessageHandlerConfig,
) -> SharedHandler {
    Arc::new(BatchingHandler::new(handler, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_batching_handler_in_pipeline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = new_batch_message_handler(
            batch_handler_fn(move |msgs: Vec<Message>| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(msgs.len());
                    Ok(())
                }
            }),
            BatchMessageHandlerConfig::default()
                .with_count_threshold(3)
                .with_delay_threshold(Duration::from_secs(3600)),
        );

        let (a, b, c) = tokio::join!(
            handler.handle(ctx(), Message::new("a").with_id("1")),
            handler.handle(ctx(), Message::new("b").with_id("2")),
            handler.handle(ctx(), Message::new("c").with_id("3")),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_zero_config_uses_defaults() {
        let handler = BatchingHandler::new(
            batch_handler_fn(|_msgs| async { Ok(()) }),
            BatchMessageHandlerConfig {
                delay_threshold: Duration::ZERO,
                count_threshold: 0,
                byte_threshold: 0,
                concurrency: 0,
                buffered_byte_limit: 0,
            },
        );
        assert_eq!(
            handler.scheduler().config(),
            &BatchMessageHandlerConfig::default()
        );
        handler.handle(ctx(), Message::new("x").with_id("1")).await.unwrap();
        handler.shutdown().await;
    }
}
