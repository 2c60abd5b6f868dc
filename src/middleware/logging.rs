//! Structured logging for message processing.

use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, field, info, info_span, Instrument};

use crate::chain::{MessageHandler, SharedHandler, SubscriptionInterceptor};
use crate::types::{DeliveryContext, Message, SubscriptionInfo};

/// Decides whether a processed message is logged.
pub type LogDecider = Arc<dyn Fn(&SubscriptionInfo, Option<&anyhow::Error>) -> bool + Send + Sync>;

/// Emits the log line for a processed message: text, error (if any) and
/// processing time. Runs inside the processing span.
pub type MessageProducer = Arc<dyn Fn(&str, Option<&anyhow::Error>, Duration) + Send + Sync>;

/// Logs every message.
pub fn default_log_decider(_info: &SubscriptionInfo, _err: Option<&anyhow::Error>) -> bool {
    true
}

/// `info!` on success, `error!` on failure, with `pubsub.time_ms`.
pub fn default_message_producer(msg: &str, err: Option<&anyhow::Error>, duration: Duration) {
    let time_ms = duration_to_milliseconds(duration);
    match err {
        Some(err) => error!(error = %err, pubsub.time_ms = time_ms, "{}", msg),
        None => info!(pubsub.time_ms = time_ms, "{}", msg),
    }
}

/// Milliseconds with microsecond precision.
pub fn duration_to_milliseconds(duration: Duration) -> f32 {
    (duration.as_micros() as f32) / 1000.0
}

/// Format `time` with a `strftime`-style pattern, or as RFC 3339 when no
/// pattern is given or the pattern is invalid.
pub fn format_timestamp(time: DateTime<Utc>, format: Option<&str>) -> String {
    if let Some(format) = format {
        let mut out = String::new();
        if write!(out, "{}", time.format(format)).is_ok() {
            return out;
        }
    }
    time.to_rfc3339()
}

/// Wraps processing in a span carrying `pubsub.start_time`, `pubsub.deadline`,
/// `pubsub.topic_id` and `pubsub.subscription_id`, then reports the outcome
/// through the [`MessageProducer`] when the [`LogDecider`] allows it.
#[derive(Clone)]
pub struct Logging {
    decider: LogDecider,
    producer: MessageProducer,
    timestamp_format: Option<Arc<str>>,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            decider: Arc::new(default_log_decider),
            producer: Arc::new(default_message_producer),
            timestamp_format: None,
        }
    }
}

impl Logging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decider<F>(mut self, f: F) -> Self
    where
        F: Fn(&SubscriptionInfo, Option<&anyhow::Error>) -> bool + Send + Sync + 'static,
    {
        self.decider = Arc::new(f);
        self
    }

    pub fn with_producer<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<&anyhow::Error>, Duration) + Send + Sync + 'static,
    {
        self.producer = Arc::new(f);
        self
    }

    /// `strftime`-style pattern for `pubsub.start_time` and `pubsub.deadline`.
    /// Defaults to RFC 3339.
    pub fn with_timestamp_format(mut self, format: impl AsRef<str>) -> Self {
        self.timestamp_format = Some(Arc::from(format.as_ref()));
        self
    }
}

impl SubscriptionInterceptor for Logging {
    fn intercept(&self, info: &SubscriptionInfo, next: SharedHandler) -> SharedHandler {
        Arc::new(LoggingHandler {
            info: info.clone(),
            next,
            decider: Arc::clone(&self.decider),
            producer: Arc::clone(&self.producer),
            timestamp_format: self.timestamp_format.clone(),
        })
    }
}

struct LoggingHandler {
    info: SubscriptionInfo,
    next: SharedHandler,
    decider: LogDecider,
    producer: MessageProducer,
    timestamp_format: Option<Arc<str>>,
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, ctx: DeliveryContext, msg: Message) -> anyhow::Result<()> {
        let started = Instant::now();
        let format = self.timestamp_format.as_deref();
        let span = info_span!(
            "pubsub.process",
            pubsub.start_time = %format_timestamp(Utc::now(), format),
            pubsub.deadline = field::Empty,
            pubsub.topic_id = %self.info.topic_id,
            pubsub.subscription_id = %self.info.subscription_id,
        );
        if let Some(deadline) = ctx.deadline {
            span.record("pubsub.deadline", field::display(format_timestamp(deadline, format)));
        }

        let message_id = msg.id.clone();
        let result = self.next.handle(ctx, msg).instrument(span.clone()).await;

        if (self.decider)(&self.info, result.as_ref().err()) {
            let text = format!("finished processing message '{message_id}'");
            span.in_scope(|| (self.producer)(&text, result.as_ref().err(), started.elapsed()));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, event_log, events, failing_handler, ok_handler, test_info, EventLog};
    use pretty_assertions::assert_eq;

    fn recording(log: EventLog) -> Logging {
        Logging::new().with_producer(move |msg, err, _elapsed| {
            let outcome = err.map(|e| e.to_string()).unwrap_or_else(|| "ok".to_string());
            log.lock().unwrap().push(format!("{msg}: {outcome}"));
        })
    }

    #[tokio::test]
    async fn test_reports_success_and_failure() {
        let log = event_log();
        let ok = recording(log.clone()).intercept(&test_info(), ok_handler());
        let failing = recording(log.clone()).intercept(&test_info(), failing_handler());

        ok.handle(ctx(), Message::new("a").with_id("1")).await.unwrap();
        assert!(failing.handle(ctx(), Message::new("b").with_id("2")).await.is_err());

        assert_eq!(
            events(&log),
            vec![
                "finished processing message '1': ok",
                "finished processing message '2': error",
            ]
        );
    }

    #[tokio::test]
    async fn test_decider_suppresses_output() {
        let log = event_log();
        let logging = recording(log.clone()).with_decider(|_info, err| err.is_some());

        let ok = logging.intercept(&test_info(), ok_handler());
        let failing = logging.intercept(&test_info(), failing_handler());
        ok.handle(ctx(), Message::new("a").with_id("1")).await.unwrap();
        let _ = failing.handle(ctx(), Message::new("b").with_id("2")).await;

        assert_eq!(events(&log), vec!["finished processing message '2': error"]);
    }

    #[tokio::test]
    async fn test_default_producer_with_deadline() {
        let handler = Logging::new().intercept(&test_info(), ok_handler());
        let ctx = ctx().with_deadline(Utc::now() + chrono::Duration::seconds(10));
        handler.handle(ctx, Message::new("a").with_id("1")).await.unwrap();
    }

    #[test]
    fn test_format_timestamp() {
        let time = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(time, None), "2024-03-05T07:08:09+00:00");
        assert_eq!(format_timestamp(time, Some("%Y-%m-%d %H:%M:%S")), "2024-03-05 07:08:09");
        assert_eq!(format_timestamp(time, Some("%Q")), "2024-03-05T07:08:09+00:00");
    }

    #[tokio::test]
    async fn test_custom_timestamp_format() {
        let handler = Logging::new()
            .with_timestamp_format("%H:%M:%S%.3f")
            .intercept(&test_info(), ok_handler());
        let ctx = ctx().with_deadline(Utc::now() + chrono::Duration::seconds(10));
        handler.handle(ctx, Message::new("a").with_id("1")).await.unwrap();
    }

    #[test]
    fn test_duration_to_milliseconds() {
        assert_eq!(duration_to_milliseconds(Duration::from_micros(1500)), 1.5);
        assert_eq!(duration_to_milliseconds(Duration::from_nanos(999)), 0.0);
        assert_eq!(duration_to_milliseconds(Duration::from_secs(2)), 2000.0);
    }
}
