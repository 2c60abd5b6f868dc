//! Effectively-once processing keyed by a message attribute.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{MessageHandler, SharedHandler, SubscriptionInterceptor};
use crate::dedup::SharedMutexer;
use crate::types::{DeliveryContext, Message, SubscriptionInfo};
use crate::DEFAULT_DEDUPLICATE_KEY;

/// Processes only the first successful delivery per dedup key; later
/// deliveries with the same key succeed without reaching the inner handler.
///
/// The key is read from the attribute named by
/// [`with_deduplicate_key`](Self::with_deduplicate_key) (default
/// `"deduplicate_key"`). Messages without it, or with an empty value, use
/// their message id.
///
/// ```ignore
/// // publisher
/// let msg = Message::new("payload").with_attribute(DEFAULT_DEDUPLICATE_KEY, "order-42");
/// publisher.publish("orders", msg).await?;
///
/// // subscriber
/// let subscriber = Subscriber::builder(broker)
///     .with_interceptor(EffectivelyOnce::new(Arc::new(MemoryMutexer::new())))
///     .build();
/// ```
#[derive(Clone)]
pub struct EffectivelyOnce {
    mutexer: SharedMutexer,
    attribute_key: Arc<str>,
}

impl EffectivelyOnce {
    pub fn new(mutexer: SharedMutexer) -> Self {
        Self {
            mutexer,
            attribute_key: Arc::from(DEFAULT_DEDUPLICATE_KEY),
        }
    }

    /// Read the dedup key from a different attribute.
    pub fn with_deduplicate_key(mut self, attribute_key: impl AsRef<str>) -> Self {
        self.attribute_key = Arc::from(attribute_key.as_ref());
        self
    }
}

impl SubscriptionInterceptor for EffectivelyOnce {
    fn intercept(&self, _info: &SubscriptionInfo, next: SharedHandler) -> SharedHandler {
        Arc::new(EffectivelyOnceHandler {
            mutexer: Arc::clone(&self.mutexer),
            attribute_key: Arc::clone(&self.attribute_key),
            next,
        })
    }
}

struct EffectivelyOnceHandler {
    mutexer: SharedMutexer,
    attribute_key: Arc<str>,
    next: SharedHandler,
}

impl EffectivelyOnceHandler {
    fn deduplicate_key(&self, msg: &Message) -> String {
        match msg.attributes.get(&*self.attribute_key) {
            Some(key) if !key.is_empty() => key.clone(),
            _ => msg.id.clone(),
        }
    }
}

#[async_trait]
impl MessageHandler for EffectivelyOnceHandler {
    async fn handle(&self, ctx: DeliveryContext, msg: Message) -> anyhow::Result<()> {
        let key = self.deduplicate_key(&msg);
        self.mutexer
            .run_exclusive_once(&key, self.next.handle(ctx, msg))
            .await
    }
}
