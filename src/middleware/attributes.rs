//! Default attributes for published messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{MessagePublisher, PublishInterceptor, SharedPublisher};
use crate::types::Message;

/// Adds fixed attributes to every published message.
///
/// Attributes already set on the message are left untouched.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    attributes: Arc<HashMap<String, String>>,
}

impl Attributes {
    pub fn new<K, V>(attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            attributes: Arc::new(
                attributes
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl PublishInterceptor for Attributes {
    fn intercept(&self, next: SharedPublisher) -> SharedPublisher {
        Arc::new(AttributesPublisher {
            attributes: Arc::clone(&self.attributes),
            next,
        })
    }
}

struct AttributesPublisher {
    attributes: Arc<HashMap<String, String>>,
    next: SharedPublisher,
}

#[async_trait]
impl MessagePublisher for AttributesPublisher {
    async fn publish(&self, topic_id: &str, mut msg: Message) -> anyhow::Result<String> {
        for (key, value) in self.attributes.iter() {
            msg.attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.next.publish(topic_id, msg).await
    }
}
