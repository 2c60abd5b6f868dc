//! Automatic ack/nack based on the handler's result.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::{MessageHandler, SharedHandler, SubscriptionInterceptor};
use crate::types::{AckHandle, DeliveryContext, Message, SubscriptionInfo};

/// Acks the message when the inner pipeline succeeds and nacks it when it
/// fails. If the inner pipeline unwinds or is dropped before returning, the
/// message is nacked as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAck;

impl SubscriptionInterceptor for AutoAck {
    fn intercept(&self, _info: &SubscriptionInfo, next: SharedHandler) -> SharedHandler {
        Arc::new(AutoAckHandler { next })
    }
}

struct AutoAckHandler {
    next: SharedHandler,
}

/// Nacks on drop unless disarmed.
struct NackOnDrop(Option<AckHandle>);

impl NackOnDrop {
    fn disarm(mut self) -> Option<AckHandle> {
        self.0.take()
    }
}

impl Drop for NackOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            debug!("Handler did not complete, nacking message");
            handle.nack();
        }
    }
}

#[async_trait]
impl MessageHandler for AutoAckHandler {
    async fn handle(&self, ctx: DeliveryContext, msg: Message) -> anyhow::Result<()> {
        let guard = NackOnDrop(msg.ack_handle());
        let result = self.next.handle(ctx, msg).await;
        if let Some(handle) = guard.disarm() {
            match &result {
                Ok(()) => handle.ack(),
                Err(_) => handle.nack(),
            };
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, failing_handler, ok_handler, received, test_info};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acks_on_success() {
        let handler = AutoAck.intercept(&test_info(), ok_handler());
        let (msg, acker) = received("1");
        handler.handle(ctx(), msg).await.unwrap();
        assert_eq!((acker.acks(), acker.nacks()), (1, 0));
    }

    #[tokio::test]
    async fn test_nacks_on_error() {
        let handler = AutoAck.intercept(&test_info(), failing_handler());
        let (msg, acker) = received("1");
        assert!(handler.handle(ctx(), msg).await.is_err());
        assert_eq!((acker.acks(), acker.nacks()), (0, 1));
    }

    #[tokio::test]
    async fn test_handler_ack_wins() {
        let inner = crate::chain::handler_fn(|_ctx, msg: Message| async move {
            msg.ack();
            Err(anyhow::anyhow!("failed after ack"))
        });
        let handler = AutoAck.intercept(&test_info(), inner);
        let (msg, acker) = received("1");
        assert!(handler.handle(ctx(), msg).await.is_err());
        assert_eq!((acker.acks(), acker.nacks()), (1, 0));
    }

    #[tokio::test]
    async fn test_nacks_when_dropped_mid_flight() {
        let inner = crate::chain::handler_fn(|_ctx, _msg| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        let handler = AutoAck.intercept(&test_info(), inner);
        let (msg, acker) = received("1");
        let result = tokio::time::timeout(Duration::from_millis(10), handler.handle(ctx(), msg)).await;
        assert!(result.is_err());
        assert_eq!((acker.acks(), acker.nacks()), (0, 1));
    }

    #[tokio::test]
    async fn test_unacked_message_is_fine() {
        let handler = AutoAck.intercept(&test_info(), ok_handler());
        handler.handle(ctx(), Message::new("no handle")).await.unwrap();
    }
}
