//! Panic recovery for subscription handlers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use crate::chain::{MessageHandler, SharedHandler, SubscriptionInterceptor};
use crate::error::{panic_message, Error};
use crate::types::{DeliveryContext, Message, SubscriptionInfo};

/// What a recovery callback gets to see about a caught panic.
pub struct RecoveredPanic<'a> {
    pub info: &'a SubscriptionInfo,
    pub ctx: &'a DeliveryContext,
    pub message_id: &'a str,
    pub payload: &'a (dyn Any + Send),
}

impl RecoveredPanic<'_> {
    /// The panic payload as text.
    pub fn message(&self) -> String {
        panic_message(self.payload)
    }
}

/// Callback invoked after a panic is caught.
pub type RecoveryHandler = Arc<dyn Fn(&RecoveredPanic<'_>) + Send + Sync>;

/// Logs the panic at error level.
pub fn default_recovery_handler(panic: &RecoveredPanic<'_>) {
    error!(
        pubsub.topic_id = %panic.info.topic_id,
        pubsub.subscription_id = %panic.info.subscription_id,
        message_id = %panic.message_id,
        panic = %panic.message(),
        "Recovered from panic in message handler"
    );
}

/// Catches panics from the inner pipeline and turns them into
/// [`Error::Panicked`], after running the recovery callback.
///
/// Place it outermost (or just inside logging) so every other interceptor is
/// covered.
#[derive(Clone)]
pub struct Recovery {
    on_panic: RecoveryHandler,
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            on_panic: Arc::new(default_recovery_handler),
        }
    }
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the recovery callback.
    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecoveredPanic<'_>) + Send + Sync + 'static,
    {
        self.on_panic = Arc::new(f);
        self
    }
}

impl SubscriptionInterceptor for Recovery {
    fn intercept(&self, info: &SubscriptionInfo, next: SharedHandler) -> SharedHandler {
        Arc::new(RecoveringHandler {
            info: info.clone(),
            next,
            on_panic: Arc::clone(&self.on_panic),
        })
    }
}

struct RecoveringHandler {
    info: SubscriptionInfo,
    next: SharedHandler,
    on_panic: RecoveryHandler,
}

#[async_trait]
impl MessageHandler for RecoveringHandler {
    async fn handle(&self, ctx: DeliveryContext, msg: Message) -> anyhow::Result<()> {
        let message_id = msg.id.clone();
        let panic_ctx = ctx.clone();
        match AssertUnwindSafe(self.next.handle(ctx, msg))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                (self.on_panic)(&RecoveredPanic {
                    info: &self.info,
                    ctx: &panic_ctx,
                    message_id: &message_id,
                    payload: &*payload,
                });
                Err(Error::Panicked {
                    message_id,
                    panic: panic_message(&*payload),
                }
                .into())
            }
        }
    }
}
