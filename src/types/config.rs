//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{DEFAULT_DEDUPLICATE_KEY, MAX_PUBLISH_REQUEST_BYTES};

/// Thresholds and limits for a batch message handler.
///
/// Zero fields are replaced by the values in [`BatchMessageHandlerConfig::default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMessageHandlerConfig {
    /// Process a non-empty batch after this delay has passed.
    pub delay_threshold: Duration,

    /// Process a batch when it has this many messages.
    pub count_threshold: usize,

    /// Process a batch when its size in bytes reaches this value.
    pub byte_threshold: usize,

    /// Number of batches handled concurrently.
    pub concurrency: usize,

    /// Total bytes of accepted messages whose batch has not been handled yet.
    pub buffered_byte_limit: usize,
}

impl Default for BatchMessageHandlerConfig {
    fn default() -> Self {
        Self {
            delay_threshold: Duration::from_millis(10),
            count_threshold: 100,
            byte_threshold: 1_000_000,
            concurrency: 10,
            // Ten maximum-size publish requests.
            buffered_byte_limit: 10 * MAX_PUBLISH_REQUEST_BYTES,
        }
    }
}

impl BatchMessageHandlerConfig {
    /// Replace zero fields with defaults.
    pub fn with_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            delay_threshold: if self.delay_threshold.is_zero() {
                defaults.delay_threshold
            } else {
                self.delay_threshold
            },
            count_threshold: non_zero_or(self.count_threshold, defaults.count_threshold),
            byte_threshold: non_zero_or(self.byte_threshold, defaults.byte_threshold),
            concurrency: non_zero_or(self.concurrency, defaults.concurrency),
            buffered_byte_limit: non_zero_or(
                self.buffered_byte_limit,
                defaults.buffered_byte_limit,
            ),
        }
    }

    pub fn with_delay_threshold(mut self, delay: Duration) -> Self {
        self.delay_threshold = delay;
        self
    }

    pub fn with_count_threshold(mut self, count: usize) -> Self {
        self.count_threshold = count;
        self
    }

    pub fn with_byte_threshold(mut self, bytes: usize) -> Self {
        self.byte_threshold = bytes;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_buffered_byte_limit(mut self, bytes: usize) -> Self {
        self.buffered_byte_limit = bytes;
        self
    }
}

fn non_zero_or(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Which dedup backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupBackend {
    /// Process-local, lost on restart.
    Memory,
    /// Durable, single process.
    Redb,
    /// Shared by every instance.
    Postgres,
}

/// Settings for effectively-once processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub backend: DedupBackend,
    /// Database file for the redb backend.
    pub path: PathBuf,
    /// Connection string for the postgres backend.
    pub database_url: Option<String>,
    /// Pool size for the postgres backend; bounds messages processed at once.
    pub max_connections: u32,
    /// Namespace prepended to every key in the store.
    pub key_prefix: String,
    /// Marks older than this are treated as absent. `None` keeps them forever.
    pub retention_secs: Option<u64>,
    /// Attribute holding the application-defined dedup key.
    pub attribute_key: String,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            backend: DedupBackend::Memory,
            path: PathBuf::from("dedup.redb"),
            database_url: None,
            max_connections: 10,
            key_prefix: "pubsub".to_string(),
            retention_secs: None,
            attribute_key: DEFAULT_DEDUPLICATE_KEY.to_string(),
        }
    }
}

impl DedupSettings {
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

/// Batch settings as they appear in configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub delay_threshold_ms: u64,
    pub count_threshold: usize,
    pub byte_threshold: usize,
    pub concurrency: usize,
    pub buffered_byte_limit: usize,
}

impl BatchSettings {
    /// Convert to a handler config, filling unset values with defaults.
    pub fn to_handler_config(&self) -> BatchMessageHandlerConfig {
        BatchMessageHandlerConfig {
            delay_threshold: Duration::from_millis(self.delay_threshold_ms),
            count_threshold: self.count_threshold,
            byte_threshold: self.byte_threshold,
            concurrency: self.concurrency,
            buffered_byte_limit: self.buffered_byte_limit,
        }
        .with_defaults()
    }
}

/// Top-level configuration for services built on this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// `tracing` filter directive.
    pub log_filter: String,
    /// Emit logs as JSON.
    pub log_json: bool,
    /// `strftime` pattern for span timestamps; RFC 3339 when unset.
    pub log_timestamp_format: Option<String>,
    pub dedup: DedupSettings,
    pub batch: BatchSettings,
    /// Attributes added to every published message that lacks them.
    pub publish_attributes: HashMap<String, String>,
    /// Deliveries after which the in-memory broker dead-letters a message.
    pub max_delivery_attempts: Option<u32>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            log_filter: "pubsub_middleware=info,pubsub_demo=info".to_string(),
            log_json: false,
            log_timestamp_format: None,
            dedup: DedupSettings::default(),
            batch: BatchSettings::default(),
            publish_attributes: HashMap::new(),
            max_delivery_attempts: Some(5),
        }
    }
}

impl PubSubConfig {
    /// Load configuration from an optional `pubsub.{toml,yaml,json}` file and
    /// `PUBSUB__*` environment variables (e.g. `PUBSUB__DEDUP__BACKEND=redb`).
    pub fn load() -> Result<Self> {
        Self::load_from("pubsub")
    }

    /// Load configuration using `file_stem` as the optional config file.
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(file_stem).required(false))
            .add_source(
                ::config::Environment::with_prefix("PUBSUB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
