//! Message model shared by the subscribe and publish paths.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Broker-side acknowledgment for one delivery.
///
/// Implemented by broker clients. `ack` tells the broker the delivery is done;
/// `nack` asks for redelivery.
pub trait Acknowledger: Send + Sync {
    fn ack(&self);
    fn nack(&self);
}

/// Cloneable handle to a delivery's acknowledgment.
///
/// The first `ack` or `nack` wins; later calls are ignored.
#[derive(Clone)]
pub struct AckHandle {
    acker: Arc<dyn Acknowledger>,
    done: Arc<AtomicBool>,
}

impl AckHandle {
    pub fn new(acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            acker,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acknowledge the delivery. Returns `false` if it was already resolved.
    pub fn ack(&self) -> bool {
        self.resolve(|acker| acker.ack())
    }

    /// Negatively acknowledge the delivery. Returns `false` if it was already resolved.
    pub fn nack(&self) -> bool {
        self.resolve(|acker| acker.nack())
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn resolve(&self, settle: impl FnOnce(&dyn Acknowledger)) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        settle(self.acker.as_ref());
        true
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

/// A pub/sub message.
///
/// Received messages carry an [`AckHandle`]; messages built for publishing do not,
/// and `ack`/`nack` on them are no-ops.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Broker-assigned id (empty until published).
    pub id: String,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Key-value attributes. Interceptors may read and mutate these.
    pub attributes: HashMap<String, String>,
    /// Ordering key, passed through untouched.
    pub ordering_key: String,
    /// Time the broker accepted the message.
    pub publish_time: Option<DateTime<Utc>>,
    /// How many times the broker has delivered this message, if it tracks that.
    pub delivery_attempt: Option<u32>,
    ack: Option<AckHandle>,
}

impl Message {
    /// Create a message for publishing.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Create a message whose payload is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }

    /// Set the message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the ordering key.
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    /// Attach the broker's acknowledgment handle.
    pub fn with_ack_handle(mut self, handle: AckHandle) -> Self {
        self.ack = Some(handle);
        self
    }

    /// Drop the acknowledgment handle, e.g. before republishing a received message.
    pub fn without_ack_handle(mut self) -> Self {
        self.ack = None;
        self
    }

    pub fn ack_handle(&self) -> Option<AckHandle> {
        self.ack.clone()
    }

    /// Acknowledge this delivery.
    pub fn ack(&self) {
        if let Some(handle) = &self.ack {
            handle.ack();
        }
    }

    /// Request redelivery of this message.
    pub fn nack(&self) {
        if let Some(handle) = &self.ack {
            handle.nack();
        }
    }

    /// Payload as UTF-8, if valid.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Size of the message in the broker's wire encoding.
    ///
    /// Mirrors the protobuf encoding of `PubsubMessage` with fields
    /// `data = 1`, `attributes = 2`, `message_id = 3`, `ordering_key = 5`.
    /// Empty scalar fields are not encoded; map entries always are.
    pub fn encoded_len(&self) -> usize {
        let mut size = bytes_field_len(self.data.len());
        for (key, value) in &self.attributes {
            let entry = bytes_field_len(key.len()) + bytes_field_len(value.len());
            size += 1 + varint_len(entry as u64) + entry;
        }
        size += bytes_field_len(self.id.len());
        size += bytes_field_len(self.ordering_key.len());
        size
    }
}

fn bytes_field_len(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        1 + varint_len(len as u64) + len
    }
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingAcker;

    #[test]
    fn test_encoded_len_empty() {
        assert_eq!(Message::default().encoded_len(), 0);
    }

    #[test]
    fn test_encoded_len_fields() {
        // data: tag + len + 4, id: tag + len + 2
        let msg = Message::new("test").with_id("42");
        assert_eq!(msg.encoded_len(), 6 + 4);

        // entry: (1 + 1 + 1) + (1 + 1 + 1) = 6, field: tag + len + 6
        let msg = Message::default().with_attribute("k", "v");
        assert_eq!(msg.encoded_len(), 8);
    }

    #[test]
    fn test_encoded_len_long_payload() {
        let msg = Message::new(vec![0u8; 200]);
        // 200 needs a two byte varint
        assert_eq!(msg.encoded_len(), 1 + 2 + 200);
    }

    #[test]
    fn test_first_resolution_wins() {
        let acker = RecordingAcker::new();
        let msg = Message::new("x").with_ack_handle(AckHandle::new(acker.clone()));
        msg.nack();
        msg.ack();
        assert_eq!(acker.acks(), 0);
        assert_eq!(acker.nacks(), 1);
    }

    #[test]
    fn test_clones_share_ack_state() {
        let acker = RecordingAcker::new();
        let msg = Message::new("x").with_ack_handle(AckHandle::new(acker.clone()));
        let copy = msg.clone();
        copy.ack();
        msg.ack();
        assert_eq!(acker.acks(), 1);
        assert!(msg.ack_handle().is_some_and(|h| h.is_done()));
    }

    #[test]
    fn test_json_payload() {
        let msg = Message::from_json(&serde_json::json!({"order": 7})).unwrap();
        let value: serde_json::Value = msg.json().unwrap();
        assert_eq!(value["order"], 7);
    }
}
