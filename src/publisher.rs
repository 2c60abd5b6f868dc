//! Publishing through the publish interceptor chain.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broker::SharedBroker;
use crate::chain::{
    MessagePublisher, PublishChain, PublishInterceptor, SharedPublishInterceptor, SharedPublisher,
};
use crate::types::Message;

/// Terminal publisher: hands the message to the broker.
struct BrokerPublisher {
    broker: SharedBroker,
}

#[async_trait]
impl MessagePublisher for BrokerPublisher {
    async fn publish(&self, topic_id: &str, msg: Message) -> anyhow::Result<String> {
        let id = self.broker.publish(topic_id, msg).await?;
        debug!(topic_id, message_id = %id, "Published message");
        Ok(id)
    }
}

/// Configures a [`Publisher`].
pub struct PublisherBuilder {
    broker: SharedBroker,
    chain: PublishChain,
}

impl PublisherBuilder {
    /// Append an interceptor. The first one added is outermost.
    pub fn with_interceptor<I: PublishInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.chain = self.chain.with(interceptor);
        self
    }

    pub fn with_shared_interceptor(mut self, interceptor: SharedPublishInterceptor) -> Self {
        self.chain = self.chain.with_shared(interceptor);
        self
    }

    pub fn build(self) -> Publisher {
        let terminal: SharedPublisher = Arc::new(BrokerPublisher {
            broker: self.broker,
        });
        Publisher {
            pipeline: self.chain.build(terminal),
        }
    }
}

/// Publishes messages through a fixed interceptor chain.
#[derive(Clone)]
pub struct Publisher {
    pipeline: SharedPublisher,
}

impl Publisher {
    pub fn builder(broker: SharedBroker) -> PublisherBuilder {
        PublisherBuilder {
            broker,
            chain: PublishChain::new(),
        }
    }

    /// A publisher without interceptors.
    pub fn new(broker: SharedBroker) -> Self {
        Self::builder(broker).build()
    }

    /// Publish `msg` to `topic_id` and return the broker-assigned id.
    pub async fn publish(&self, topic_id: &str, msg: Message) -> anyhow::Result<String> {
        self.pipeline.publish(topic_id, msg).await
    }
}
