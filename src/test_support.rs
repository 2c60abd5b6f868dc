//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chain::{handler_fn, SharedHandler};
use crate::types::{AckHandle, Acknowledger, DeliveryContext, Message, SubscriptionInfo};

/// Acknowledger that counts acks and nacks.
#[derive(Default)]
pub struct RecordingAcker {
    acks: AtomicUsize,
    nacks: AtomicUsize,
}

impl RecordingAcker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nacks(&self) -> usize {
        self.nacks.load(Ordering::SeqCst)
    }
}

impl Acknowledger for RecordingAcker {
    fn ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    fn nack(&self) {
        self.nacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// A received message wired to a fresh [`RecordingAcker`].
pub fn received(id: &str) -> (Message, Arc<RecordingAcker>) {
    let acker = RecordingAcker::new();
    let msg = Message::new(id.as_bytes().to_vec())
        .with_id(id)
        .with_ack_handle(AckHandle::new(acker.clone()));
    (msg, acker)
}

pub fn test_info() -> SubscriptionInfo {
    SubscriptionInfo::new("test-topic", "test-sub")
}

pub fn ctx() -> DeliveryContext {
    DeliveryContext::default()
}

/// Handler that always succeeds.
pub fn ok_handler() -> SharedHandler {
    handler_fn(|_ctx, _msg| async { Ok(()) })
}

/// Handler that always fails with `error`.
pub fn failing_handler() -> SharedHandler {
    handler_fn(|_ctx, _msg| async { Err(anyhow::anyhow!("error")) })
}

/// Ordered log shared between test interceptors.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}
