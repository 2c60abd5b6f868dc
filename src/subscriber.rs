//! Pull-subscription orchestration.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::SharedBroker;
use crate::chain::{
    SharedHandler, SharedSubscriptionInterceptor, SubscriptionChain, SubscriptionInterceptor,
};
use crate::error::{Error, Result};
use crate::types::SubscriptionInfo;

/// Configures a [`Subscriber`]. The interceptor chain is fixed once built.
pub struct SubscriberBuilder {
    broker: SharedBroker,
    chain: SubscriptionChain,
}

impl SubscriberBuilder {
    /// Append an interceptor. The first one added is outermost.
    pub fn with_interceptor<I: SubscriptionInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.chain = self.chain.with(interceptor);
        self
    }

    pub fn with_shared_interceptor(mut self, interceptor: SharedSubscriptionInterceptor) -> Self {
        self.chain = self.chain.with_shared(interceptor);
        self
    }

    pub fn build(self) -> Subscriber {
        Subscriber {
            broker: self.broker,
            chain: self.chain,
            registrations: Mutex::new(HashMap::new()),
            cancel: Mutex::new(None),
            workers: TaskTracker::new(),
        }
    }
}

struct Registration {
    info: SubscriptionInfo,
    handler: SharedHandler,
}

/// Runs one receive loop per registered subscription, each feeding its
/// handler through the interceptor chain.
///
/// ```ignore
/// let subscriber = Subscriber::builder(broker)
///     .with_interceptor(Logging::new())
///     .with_interceptor(Recovery::new())
///     .with_interceptor(AutoAck)
///     .build();
/// subscriber.handle_subscription("orders-sub", handler).await?;
/// subscriber.run(&shutdown);
/// // ...
/// subscriber.close().await;
/// ```
pub struct Subscriber {
    broker: SharedBroker,
    chain: SubscriptionChain,
    registrations: Mutex<HashMap<String, Registration>>,
    /// Set while running.
    cancel: Mutex<Option<CancellationToken>>,
    workers: TaskTracker,
}

impl Subscriber {
    pub fn builder(broker: SharedBroker) -> SubscriberBuilder {
        SubscriberBuilder {
            broker,
            chain: SubscriptionChain::new(),
        }
    }

    /// A subscriber without interceptors.
    pub fn new(broker: SharedBroker) -> Self {
        Self::builder(broker).build()
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Registered subscription ids, sorted.
    pub fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registrations().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register the handler for a subscription.
    ///
    /// The subscription's topic is looked up on the broker, so a missing
    /// subscription fails here rather than at [`run`](Self::run).
    pub async fn handle_subscription(
        &self,
        subscription_id: &str,
        handler: SharedHandler,
    ) -> Result<()> {
        self.check_registrable(subscription_id)?;
        let config = self.broker.subscription_config(subscription_id).await?;

        // Re-check: the lookup above may race with another registration.
        self.check_registrable(subscription_id)?;
        let info = SubscriptionInfo::new(config.topic_id, subscription_id);
        self.registrations()
            .insert(subscription_id.to_string(), Registration { info, handler });
        info!(subscription_id, "Registered subscription handler");
        Ok(())
    }

    /// Register several handlers, resolving their subscriptions concurrently.
    /// Fails on the first error; handlers registered before it stay registered.
    pub async fn handle_subscription_map(
        &self,
        handlers: HashMap<String, SharedHandler>,
    ) -> Result<()> {
        try_join_all(
            handlers
                .iter()
                .map(|(id, handler)| self.handle_subscription(id, handler.clone())),
        )
        .await?;
        Ok(())
    }

    fn check_registrable(&self, subscription_id: &str) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning(subscription_id.to_string()));
        }
        if self.registrations().contains_key(subscription_id) {
            return Err(Error::AlreadyRegistered(subscription_id.to_string()));
        }
        Ok(())
    }

    /// Start a worker per registered subscription. Workers stop when `parent`
    /// is cancelled or [`close`](Self::close) is called.
    pub fn run(&self, parent: &CancellationToken) {
        let cancel = {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                warn!("Subscriber is already running");
                return;
            }
            let cancel = parent.child_token();
            *slot = Some(cancel.clone());
            cancel
        };

        let registrations = self.registrations();
        for (subscription_id, registration) in registrations.iter() {
            let pipeline = self
                .chain
                .build(&registration.info, registration.handler.clone());
            let broker = self.broker.clone();
            let cancel = cancel.clone();
            let subscription_id = subscription_id.clone();
            let topic_id = registration.info.topic_id.clone();

            self.workers.spawn(async move {
                info!(subscription_id = %subscription_id, topic_id = %topic_id, "Subscription worker started");
                if let Err(e) = broker.receive(&subscription_id, cancel, pipeline).await {
                    error!(subscription_id = %subscription_id, error = %e, "Subscription receive failed");
                }
                info!(subscription_id = %subscription_id, "Subscription worker stopped");
            });
        }
        info!(subscriptions = registrations.len(), "Subscriber running");
    }

    /// Stop receiving and wait for every worker and in-flight message.
    pub async fn close(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.workers.close();
        self.workers.wait().await;
    }
}
