//! In-process broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::BrokerClient;
use crate::chain::SharedHandler;
use crate::error::{Error, Result};
use crate::types::{AckHandle, Acknowledger, DeliveryContext, Message, SubscriptionConfig};

const DEFAULT_ACK_DEADLINE_SECS: u64 = 10;
const DEFAULT_MAX_OUTSTANDING: usize = 1000;

/// Delivery counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
}

struct Delivery {
    message: Message,
    attempt: u32,
}

struct SubscriptionQueue {
    config: SubscriptionConfig,
    max_delivery_attempts: Option<u32>,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Only one `receive` drains a subscription at a time.
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    stats: Mutex<SubscriptionStats>,
    dead_letters: Mutex<Vec<Message>>,
}

impl SubscriptionQueue {
    fn stats(&self) -> std::sync::MutexGuard<'_, SubscriptionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, message: Message, attempt: u32) {
        if self.tx.send(Delivery { message, attempt }).is_err() {
            warn!(subscription_id = %self.config.subscription_id, "Subscription queue closed, dropping message");
        }
    }

    /// Redeliver, or dead-letter once the attempt budget is spent.
    fn redeliver(&self, message: Message, attempt: u32) {
        match self.max_delivery_attempts {
            Some(max) if attempt >= max => {
                warn!(
                    subscription_id = %self.config.subscription_id,
                    message_id = %message.id,
                    attempt,
                    "Delivery attempts exhausted, dead-lettering message"
                );
                self.stats().dead_lettered += 1;
                self.dead_letters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message);
            }
            _ => self.enqueue(message, attempt + 1),
        }
    }
}

/// Settles one delivery. Dropping it unsettled counts as an expired ack
/// deadline and redelivers the message.
struct DeliveryAcker {
    queue: Arc<SubscriptionQueue>,
    message: Message,
    attempt: u32,
    settled: AtomicBool,
}

impl Acknowledger for DeliveryAcker {
    fn ack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.queue.stats().acked += 1;
        }
    }

    fn nack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.queue.stats().nacked += 1;
            self.queue.redeliver(self.message.clone(), self.attempt);
        }
    }
}

impl Drop for DeliveryAcker {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            debug!(message_id = %self.message.id, "Delivery dropped without ack, redelivering");
            self.queue.redeliver(self.message.clone(), self.attempt);
        }
    }
}

/// Topics and subscriptions kept in process memory.
///
/// Publishing fans a message out to every subscription of the topic. Nacked
/// messages are redelivered with an incremented attempt count; with
/// [`with_max_delivery_attempts`](Self::with_max_delivery_attempts) set, a
/// message that fails that many times moves to the subscription's dead
/// letters instead.
#[derive(Clone)]
pub struct InMemoryBroker {
    topics: Arc<RwLock<HashMap<String, Vec<Arc<SubscriptionQueue>>>>>,
    subscriptions: Arc<RwLock<HashMap<String, Arc<SubscriptionQueue>>>>,
    max_delivery_attempts: Option<u32>,
    max_outstanding: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            max_delivery_attempts: None,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
        }
    }

    /// Applies to subscriptions created afterwards. `None` retries forever.
    pub fn with_max_delivery_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    /// Deliveries handled concurrently per `receive` call.
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = max.max(1);
        self
    }

    /// Create a topic. Creating an existing topic is a no-op.
    pub fn create_topic(&self, topic_id: impl Into<String>) {
        let topic_id = topic_id.into();
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if !topics.contains_key(&topic_id) {
            info!(topic_id = %topic_id, "Created topic");
            topics.insert(topic_id, Vec::new());
        }
    }

    /// Attach a new subscription to an existing topic.
    pub fn create_subscription(
        &self,
        subscription_id: impl Into<String>,
        topic_id: &str,
    ) -> Result<SubscriptionConfig> {
        let subscription_id = subscription_id.into();
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let subscribers = topics
            .get_mut(topic_id)
            .ok_or_else(|| Error::TopicNotFound(topic_id.to_string()))?;

        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.contains_key(&subscription_id) {
            return Err(Error::Broker(format!(
                "subscription '{subscription_id}' already exists"
            )));
        }

        let config = SubscriptionConfig {
            subscription_id: subscription_id.clone(),
            topic_id: topic_id.to_string(),
            ack_deadline_secs: DEFAULT_ACK_DEADLINE_SECS,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(SubscriptionQueue {
            config: config.clone(),
            max_delivery_attempts: self.max_delivery_attempts,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            stats: Mutex::new(SubscriptionStats::default()),
            dead_letters: Mutex::new(Vec::new()),
        });
        subscribers.push(Arc::clone(&queue));
        subscriptions.insert(subscription_id.clone(), queue);

        info!(subscription_id = %subscription_id, topic_id = %topic_id, "Created subscription");
        Ok(config)
    }

    pub fn stats(&self, subscription_id: &str) -> Option<SubscriptionStats> {
        let queue = self.queue(subscription_id).ok()?;
        let stats = *queue.stats();
        Some(stats)
    }

    /// Messages that exhausted their delivery attempts.
    pub fn dead_letters(&self, subscription_id: &str) -> Vec<Message> {
        let Ok(queue) = self.queue(subscription_id) else {
            return Vec::new();
        };
        let dead_letters = queue
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        dead_letters
    }

    fn queue(&self, subscription_id: &str) -> Result<Arc<SubscriptionQueue>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| Error::SubscriptionNotFound(subscription_id.to_string()))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn subscription_config(&self, subscription_id: &str) -> Result<SubscriptionConfig> {
        Ok(self.queue(subscription_id)?.config.clone())
    }

    async fn subscription_exists(&self, subscription_id: &str) -> Result<bool> {
        Ok(self.queue(subscription_id).is_ok())
    }

    async fn receive(
        &self,
        subscription_id: &str,
        cancel: CancellationToken,
        handler: SharedHandler,
    ) -> Result<()> {
        let queue = self.queue(subscription_id)?;
        let mut rx = queue.rx.lock().await;
        let permits = Arc::new(Semaphore::new(self.max_outstanding));
        let tasks = TaskTracker::new();

        debug!(subscription_id, "Receiving");
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.map_err(|e| Error::Broker(e.to_string()))?
                }
            };
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            queue.stats().delivered += 1;
            let acker = Arc::new(DeliveryAcker {
                queue: Arc::clone(&queue),
                message: delivery.message.clone(),
                attempt: delivery.attempt,
                settled: AtomicBool::new(false),
            });
            let mut message = delivery.message.with_ack_handle(AckHandle::new(acker));
            message.delivery_attempt = Some(delivery.attempt);
            let ctx = DeliveryContext::new(cancel.clone())
                .with_deadline(
                    Utc::now() + chrono::Duration::seconds(queue.config.ack_deadline_secs as i64),
                )
                .with_delivery_attempt(delivery.attempt);

            let handler = Arc::clone(&handler);
            tasks.spawn(async move {
                let _permit = permit;
                let _ = handler.handle(ctx, message).await;
            });
        }

        tasks.close();
        tasks.wait().await;
        debug!(subscription_id, "Stopped receiving");
        Ok(())
    }

    async fn publish(&self, topic_id: &str, msg: Message) -> Result<String> {
        let subscribers = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic_id)
            .cloned()
            .ok_or_else(|| Error::TopicNotFound(topic_id.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let mut message = msg.without_ack_handle().with_id(id.clone());
        message.publish_time = Some(Utc::now());
        message.delivery_attempt = None;

        for queue in &subscribers {
            queue.enqueue(message.clone(), 1);
        }
        debug!(topic_id, message_id = %id, subscriptions = subscribers.len(), "Published message");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::handler_fn;
    use std::time::Duration;

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new().with_max_delivery_attempts(Some(3));
        broker.create_topic("topic");
        broker.create_subscription("sub", "topic").unwrap();
        broker
    }

    /// Receive until `n` messages have been seen, then stop.
    async fn receive_n(broker: &InMemoryBroker, n: usize, handler: SharedHandler) -> Vec<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let recording = handler_fn(move |ctx, msg: Message| {
            let tx = tx.clone();
            let handler = Arc::clone(&handler);
            async move {
                let seen = msg.clone().without_ack_handle();
                let result = handler.handle(ctx, msg).await;
                let _ = tx.send(seen);
                result
            }
        });

        let worker = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.receive("sub", cancel, recording).await }
        });

        let mut seen = Vec::new();
        while seen.len() < n {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(msg)) => seen.push(msg),
                _ => break,
            }
        }
        cancel.cancel();
        worker.await.unwrap().unwrap();
        seen
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let broker = broker();
        broker.create_subscription("other", "topic").unwrap();

        let id = broker
            .publish("topic", Message::new("hello").with_ordering_key("k"))
            .await
            .unwrap();

        let acking = handler_fn(|_ctx, msg: Message| async move {
            msg.ack();
            Ok(())
        });
        let seen = receive_n(&broker, 1, acking).await;
        assert_eq!(seen[0].id, id);
        assert_eq!(seen[0].ordering_key, "k");
        assert_eq!(seen[0].delivery_attempt, Some(1));
        assert!(seen[0].publish_time.is_some());

        assert_eq!(broker.stats("sub").unwrap().acked, 1);
        assert_eq!(broker.stats("other").unwrap().delivered, 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let broker = broker();
        broker.publish("topic", Message::new("bad")).await.unwrap();

        let nacking = handler_fn(|_ctx, msg: Message| async move {
            msg.nack();
            Ok(())
        });
        let seen = receive_n(&broker, 3, nacking).await;
        let attempts: Vec<_> = seen.iter().map(|m| m.delivery_attempt).collect();
        assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);

        let stats = broker.stats("sub").unwrap();
        assert_eq!(stats.nacked, 3);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_letters("sub").len(), 1);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_is_redelivered() {
        let broker = broker();
        broker.publish("topic", Message::new("forgotten")).await.unwrap();

        let forgetful = handler_fn(|_ctx, msg: Message| async move {
            if msg.delivery_attempt == Some(2) {
                msg.ack();
            }
            Ok(())
        });
        let seen = receive_n(&broker, 2, forgetful).await;
        assert_eq!(seen.len(), 2);
        assert_eq!(broker.stats("sub").unwrap().acked, 1);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let broker = broker();
        assert!(matches!(
            broker.publish("missing", Message::new("x")).await,
            Err(Error::TopicNotFound(_))
        ));
        assert!(matches!(
            broker.subscription_config("missing").await,
            Err(Error::SubscriptionNotFound(_))
        ));
        assert!(!broker.subscription_exists("missing").await.unwrap());
        assert!(broker.subscription_exists("sub").await.unwrap());
        assert!(matches!(
            broker.create_subscription("x", "missing"),
            Err(Error::TopicNotFound(_))
        ));
        assert!(matches!(
            broker.create_subscription("sub", "topic"),
            Err(Error::Broker(_))
        ));
    }
}
