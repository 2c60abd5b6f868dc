//! Broker client abstraction.
//!
//! Subscribers and publishers talk to the broker only through
//! [`BrokerClient`]. [`InMemoryBroker`] implements it in-process for tests,
//! demos and single-process deployments.

mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use in_memory::{InMemoryBroker, SubscriptionStats};

use crate::chain::SharedHandler;
use crate::error::Result;
use crate::types::{Message, SubscriptionConfig};

/// Operations the middleware needs from a pub/sub broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Look up a subscription, failing with
    /// [`Error::SubscriptionNotFound`](crate::Error::SubscriptionNotFound).
    async fn subscription_config(&self, subscription_id: &str) -> Result<SubscriptionConfig>;

    async fn subscription_exists(&self, subscription_id: &str) -> Result<bool>;

    /// Deliver messages from the subscription to `handler` until `cancel`
    /// fires. Each delivery carries an ack handle; handler results are not
    /// interpreted by the broker. Returns after in-flight deliveries finish.
    async fn receive(
        &self,
        subscription_id: &str,
        cancel: CancellationToken,
        handler: SharedHandler,
    ) -> Result<()>;

    /// Publish to a topic and return the broker-assigned message id.
    async fn publish(&self, topic_id: &str, msg: Message) -> Result<String>;
}

pub type SharedBroker = Arc<dyn BrokerClient>;
