//! Pub/Sub Middleware Demo - Main Entry Point
//!
//! Runs an in-memory broker with a recovering, auto-acking, deduplicating
//! subscription and a batched subscription, publishes a few messages and
//! shuts down on Ctrl-C or after a short while.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pubsub_middleware::batch::{batch_handler_fn, BatchError, BatchingHandler};
use pubsub_middleware::dedup;
use pubsub_middleware::middleware::{Attributes, AutoAck, EffectivelyOnce, Logging, Recovery};
use pubsub_middleware::{
    handler_fn, DeliveryContext, InMemoryBroker, Message, PubSubConfig, Publisher, Subscriber,
    DEFAULT_DEDUPLICATE_KEY,
};

const TOPIC: &str = "pm-example";
const SUBSCRIPTION: &str = "pm-example-sub";
const BATCH_SUBSCRIPTION: &str = "pm-example-batch-sub";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = PubSubConfig::load()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone()),
    );
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting pubsub demo v{}", env!("CARGO_PKG_VERSION"));

    let broker = InMemoryBroker::new().with_max_delivery_attempts(config.max_delivery_attempts);
    broker.create_topic(TOPIC);
    broker.create_subscription(SUBSCRIPTION, TOPIC)?;
    broker.create_subscription(BATCH_SUBSCRIPTION, TOPIC)?;
    let broker = Arc::new(broker);

    let logging = match &config.log_timestamp_format {
        Some(format) => Logging::new().with_timestamp_format(format),
        None => Logging::new(),
    };

    let mutexer = dedup::from_settings(&config.dedup).await?;
    let subscriber = Subscriber::builder(broker.clone())
        .with_interceptor(logging.clone())
        .with_interceptor(Recovery::new())
        .with_interceptor(AutoAck)
        .with_interceptor(
            EffectivelyOnce::new(mutexer).with_deduplicate_key(&config.dedup.attribute_key),
        )
        .build();
    subscriber
        .handle_subscription_map(HashMap::from([(
            SUBSCRIPTION.to_string(),
            handler_fn(handle_message),
        )]))
        .await?;

    let batch_handler =
        BatchingHandler::new(batch_handler_fn(handle_batch), config.batch.to_handler_config());
    let batch_subscriber = Subscriber::builder(broker.clone())
        .with_interceptor(logging)
        .with_interceptor(AutoAck)
        .build();
    batch_subscriber
        .handle_subscription(BATCH_SUBSCRIPTION, Arc::new(batch_handler.clone()))
        .await?;

    let shutdown = CancellationToken::new();
    subscriber.run(&shutdown);
    batch_subscriber.run(&shutdown);

    let publisher = Publisher::builder(broker.clone())
        .with_interceptor(Attributes::new(config.publish_attributes.clone()))
        .build();
    for data in ["hello", "panic", "error"] {
        publisher.publish(TOPIC, Message::new(data)).await?;
    }
    for _ in 0..2 {
        let msg = Message::new("order created").with_attribute(DEFAULT_DEDUPLICATE_KEY, "order-1");
        publisher.publish(TOPIC, msg).await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
    }

    info!("Shutting down");
    shutdown.cancel();
    subscriber.close().await;
    batch_subscriber.close().await;
    batch_handler.shutdown().await;

    for subscription_id in [SUBSCRIPTION, BATCH_SUBSCRIPTION] {
        if let Some(stats) = broker.stats(subscription_id) {
            info!(
                subscription_id,
                delivered = stats.delivered,
                acked = stats.acked,
                nacked = stats.nacked,
                dead_lettered = stats.dead_lettered,
                "Subscription summary"
            );
        }
    }
    Ok(())
}

async fn handle_message(_ctx: DeliveryContext, msg: Message) -> Result<()> {
    match msg.data_str() {
        Some("panic") => panic!("panic"),
        Some("error") => Err(anyhow!("error")),
        data => {
            info!(message_id = %msg.id, data = data.unwrap_or("<binary>"), "Handled message");
            Ok(())
        }
    }
}

async fn handle_batch(messages: Vec<Message>) -> Result<()> {
    info!(count = messages.len(), "Handling batch");
    let failures: BatchError = messages
        .iter()
        .filter(|msg| msg.data_str() == Some("error"))
        .map(|msg| (msg.id.clone(), anyhow!("error")))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.into())
    }
}
