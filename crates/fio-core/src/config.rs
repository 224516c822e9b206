//! Configuration structures for fio.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! Every field has a default, so an empty file (or none at all) describes a
//! pipeline reading `FIO` from a local broker and writing `FIO_ENRICHED`.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Kafka connection and topics
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Output publisher configuration
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Lookup service configuration
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Topic carrying identity records
    #[serde(default = "default_input_topic")]
    pub input_topic: String,

    /// Topic receiving enriched or failed records
    #[serde(default = "default_output_topic")]
    pub output_topic: String,

    /// Auto offset reset strategy
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Max poll interval in milliseconds (must exceed the slowest enrich + publish)
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            consumer_group: default_consumer_group(),
            input_topic: default_input_topic(),
            output_topic: default_output_topic(),
            auto_offset_reset: OffsetReset::default(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            security: KafkaSecurityConfig::default(),
        }
    }
}

impl KafkaConfig {
    /// Bootstrap servers joined for librdkafka.
    pub fn brokers(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

/// Kafka auto offset reset strategy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

impl OffsetReset {
    /// Value for `auto.offset.reset`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// Output publisher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    /// Broker-side delivery timeout per attempt (`message.timeout.ms`)
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Required acknowledgments (`acks`)
    #[serde(default = "default_acks")]
    pub acks: String,

    /// Topic for records that could not be delivered
    #[serde(default)]
    pub dead_letter_topic: Option<String>,

    /// Time allowed to drain in-flight records on shutdown
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Delivery retry policy
    #[serde(default = "default_publisher_retry")]
    pub retry: RetryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: default_message_timeout_ms(),
            acks: default_acks(),
            dead_letter_topic: None,
            flush_timeout_ms: default_flush_timeout_ms(),
            retry: default_publisher_retry(),
        }
    }
}

impl PublisherConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// How the three lookups of one record are issued.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LookupStrategy {
    /// Age, then gender, then nationality; stop at the first failure
    #[default]
    Sequential,
    /// All three at once; any failure fails the record
    Concurrent,
}

/// Lookup service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LookupConfig {
    /// Age service base URL
    #[serde(default = "default_age_url")]
    pub age_url: String,

    /// Gender service base URL
    #[serde(default = "default_gender_url")]
    pub gender_url: String,

    /// Nationality service base URL
    #[serde(default = "default_nationality_url")]
    pub nationality_url: String,

    /// Ceiling for one HTTP call in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Lookup issuance strategy
    #[serde(default)]
    pub strategy: LookupStrategy,

    /// Consecutive failures before a service's circuit opens (0 disables)
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Seconds an open circuit waits before probing again
    #[serde(default = "default_circuit_reset_seconds")]
    pub circuit_reset_seconds: u64,

    /// Retry policy for transient lookup failures
    #[serde(default = "default_lookup_retry")]
    pub retry: RetryConfig,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            age_url: default_age_url(),
            gender_url: default_gender_url(),
            nationality_url: default_nationality_url(),
            request_timeout_ms: default_request_timeout_ms(),
            strategy: LookupStrategy::default(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_seconds: default_circuit_reset_seconds(),
            retry: default_lookup_retry(),
        }
    }
}

impl LookupConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_reset_seconds)
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_consumer_group() -> String {
    "fio-group".to_string()
}
fn default_input_topic() -> String {
    "FIO".to_string()
}
fn default_output_topic() -> String {
    "FIO_ENRICHED".to_string()
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_heartbeat_interval_ms() -> u32 {
    3000
}
fn default_max_poll_interval_ms() -> u32 {
    300000
}
fn default_message_timeout_ms() -> u64 {
    5000
}
fn default_acks() -> String {
    "all".to_string()
}
fn default_flush_timeout_ms() -> u64 {
    10000
}
fn default_publisher_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        base_delay_ms: 100,
        max_delay_ms: 5000,
        jitter: true,
    }
}
fn default_age_url() -> String {
    "https://api.agify.io".to_string()
}
fn default_gender_url() -> String {
    "https://api.genderize.io".to_string()
}
fn default_nationality_url() -> String {
    "https://api.nationalize.io".to_string()
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_reset_seconds() -> u64 {
    30
}
fn default_lookup_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        base_delay_ms: 100,
        max_delay_ms: 2000,
        jitter: true,
    }
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let kafka = &self.kafka;

        if kafka.bootstrap_servers.iter().all(|s| s.trim().is_empty()) {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if kafka.consumer_group.is_empty() {
            return Err(crate::Error::Config("Consumer group is required".into()));
        }

        if kafka.input_topic.is_empty() || kafka.output_topic.is_empty() {
            return Err(crate::Error::Config(
                "Input and output topics are required".into(),
            ));
        }

        if kafka.input_topic == kafka.output_topic {
            return Err(crate::Error::Config(format!(
                "Input and output topic must differ (both are '{}')",
                kafka.input_topic
            )));
        }

        if let Some(dlq) = &self.publisher.dead_letter_topic {
            if dlq.is_empty() || dlq == &kafka.input_topic || dlq == &kafka.output_topic {
                return Err(crate::Error::Config(format!(
                    "Dead-letter topic '{}' must be non-empty and distinct from input and output topics",
                    dlq
                )));
            }
        }

        if self.lookup.request_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "Lookup request timeout must be greater than zero".into(),
            ));
        }

        for (attribute, url) in [
            ("age", &self.lookup.age_url),
            ("gender", &self.lookup.gender_url),
            ("nationality", &self.lookup.nationality_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(crate::Error::Config(format!(
                    "Lookup URL for {} must be http(s): '{}'",
                    attribute, url
                )));
            }
        }

        let worst_case_ms = self
            .lookup
            .request_timeout_ms
            .saturating_mul(3)
            .saturating_add(self.publisher.message_timeout_ms);
        if u64::from(self.kafka.max_poll_interval_ms) <= worst_case_ms {
            tracing::warn!(
                max_poll_interval_ms = self.kafka.max_poll_interval_ms,
                "max.poll.interval.ms is close to the worst-case time for one record"
            );
        }

        Ok(())
    }
}
