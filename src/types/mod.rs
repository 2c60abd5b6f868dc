//! Core types shared by every component.

mod config;
mod message;
mod subscription;

pub use config::{
    BatchMessageHandlerConfig, BatchSettings, DedupBackend, DedupSettings, PubSubConfig,
};
pub use message::{AckHandle, Acknowledger, Message};
pub use subscription::{DeliveryContext, SubscriptionConfig, SubscriptionInfo};
