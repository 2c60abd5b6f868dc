//! Ready-made interceptors.
//!
//! Subscription side: [`Recovery`], [`AutoAck`], [`Logging`], [`EffectivelyOnce`].
//! Publish side: [`Attributes`].
//!
//! A typical subscription chain is `[Logging, Recovery, AutoAck, EffectivelyOnce]`:
//! logging observes the final outcome, recovery turns panics into errors
//! before they reach it, and autoack settles the message after dedup has run.

mod attributes;
mod autoack;
mod effectively_once;
mod logging;
mod recovery;

pub use attributes::Attributes;
pub use autoack::AutoAck;
pub use effectively_once::EffectivelyOnce;
pub use logging::{
    default_log_decider, default_message_producer, duration_to_milliseconds, format_timestamp,
    LogDecider, Logging, MessageProducer,
};
pub use recovery::{default_recovery_handler, RecoveredPanic, Recovery, RecoveryHandler};
