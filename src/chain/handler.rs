//! Handler and publisher abstractions wrapped by interceptors.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{DeliveryContext, Message};

/// Processes one message.
///
/// Returning an error marks the message as failed; with the autoack
/// interceptor installed that means a nack and redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: DeliveryContext, msg: Message) -> anyhow::Result<()>;
}

/// Shared, type-erased message handler.
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Publishes one message to a topic and resolves to the broker-assigned id.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic_id: &str, msg: Message) -> anyhow::Result<String>;
}

/// Shared, type-erased publisher.
pub type SharedPublisher = Arc<dyn MessagePublisher>;

/// Handler backed by a closure. Created by [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(DeliveryContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: DeliveryContext, msg: Message) -> anyhow::Result<()> {
        (self.f)(ctx, msg).await
    }
}

/// Build a handler from an async closure.
///
/// ```ignore
/// let handler = handler_fn(|_ctx, msg| async move {
///     tracing::info!(id = %msg.id, "received");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(DeliveryContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}

/// Publisher backed by a closure. Created by [`publisher_fn`].
pub struct PublisherFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessagePublisher for PublisherFn<F>
where
    F: Fn(String, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn publish(&self, topic_id: &str, msg: Message) -> anyhow::Result<String> {
        (self.f)(topic_id.to_string(), msg).await
    }
}

/// Build a publisher from an async closure.
pub fn publisher_fn<F, Fut>(f: F) -> SharedPublisher
where
    F: Fn(String, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(PublisherFn { f })
}
