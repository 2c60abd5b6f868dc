//! Subscription descriptors and per-delivery context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Identifies which pipeline instance is running.
///
/// Passed to every subscription interceptor when the pipeline is composed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub topic_id: String,
    pub subscription_id: String,
}

impl SubscriptionInfo {
    pub fn new(topic_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            subscription_id: subscription_id.into(),
        }
    }
}

/// Broker-side configuration of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub subscription_id: String,
    pub topic_id: String,
    /// Seconds the broker waits for an ack before redelivering.
    pub ack_deadline_secs: u64,
}

/// Context the broker supplies with each delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    /// Time by which the delivery should be acked.
    pub deadline: Option<DateTime<Utc>>,
    /// Delivery attempt number, starting at 1.
    pub delivery_attempt: Option<u32>,
    /// Fires when the owning subscription is shutting down.
    pub cancel: CancellationToken,
}

impl DeliveryContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = Some(attempt);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
