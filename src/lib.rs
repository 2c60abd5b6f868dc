//! Pub/Sub Middleware Library
//!
//! Interceptor chains for pull subscriptions and publishing: panic recovery,
//! automatic ack/nack, structured logging, default attributes, effectively-once
//! processing, and batched message handling on top of any [`BrokerClient`].

pub mod batch;
pub mod broker;
pub mod chain;
pub mod dedup;
pub mod error;
pub mod middleware;
pub mod publisher;
pub mod subscriber;
pub mod types;

#[cfg(test)]
mod test_support;

pub use batch::{new_batch_message_handler, BatchError, BatchScheduler, MessageBatchHandler};
pub use broker::{BrokerClient, InMemoryBroker};
pub use chain::{
    handler_fn, publisher_fn, MessageHandler, MessagePublisher, PublishInterceptor,
    SubscriptionInterceptor,
};
pub use dedup::{MemoryMutexer, Mutexer, PostgresMutexer, RedbMutexer};
pub use error::{Error, Result};
pub use publisher::Publisher;
pub use subscriber::Subscriber;
pub use types::{BatchMessageHandlerConfig, DeliveryContext, Message, PubSubConfig, SubscriptionInfo};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batch::*;
    pub use crate::broker::*;
    pub use crate::chain::*;
    pub use crate::dedup::{MemoryMutexer, Mutexer, PostgresMutexer, RedbMutexer, SharedMutexer};
    pub use crate::error::Error;
    pub use crate::middleware::*;
    pub use crate::publisher::*;
    pub use crate::subscriber::*;
    pub use crate::types::*;
}

/// Attribute the effectively-once interceptor reads the dedup key from.
pub const DEFAULT_DEDUPLICATE_KEY: &str = "deduplicate_key";

/// Largest publish request the broker accepts (10MB)
pub const MAX_PUBLISH_REQUEST_BYTES: usize = 10_000_000;
