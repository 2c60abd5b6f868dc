//! Batch message handling.
//!
//! [`new_batch_message_handler`] turns a [`MessageBatchHandler`] into a
//! regular per-message handler: messages are grouped by the [`BatchScheduler`]
//! and each caller gets back the outcome for its own message.

mod error;
mod handler;
mod scheduler;

pub use error::BatchError;
pub use handler::{
    batch_handler_fn, new_batch_message_handler, BatchHandlerFn, BatchingHandler,
    MessageBatchHandler, SharedBatchHandler,
};
pub use scheduler::BatchScheduler;
