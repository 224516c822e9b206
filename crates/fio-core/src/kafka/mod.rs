//! Kafka input and output for the enrichment pipeline.
//!
//! The pipeline only sees the [`MessageSource`] and [`OutcomeSink`] traits;
//! [`IdentityConsumer`] and [`OutcomePublisher`] are their rdkafka-backed
//! implementations.

mod consumer;
mod producer;

pub use consumer::IdentityConsumer;
pub use producer::{DeadLetter, OutcomePublisher};

use crate::config::KafkaSecurityConfig;
use crate::model::EnrichedOutcome;
use crate::Result;
use async_trait::async_trait;
use rdkafka::ClientConfig;
use std::fmt;

/// A record read from the input topic, owned and detached from the client.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message value, `None` for tombstones
    pub value: Option<Vec<u8>>,

    pub topic: String,
    pub partition: i32,
    pub offset: i64,

    /// Message timestamp (milliseconds since epoch)
    pub timestamp: i64,

    pub headers: Vec<(String, Vec<u8>)>,
}

impl InboundMessage {
    /// Position of this record in its topic.
    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// Get the message value as a string.
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_ref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Topic, partition and offset of an input record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Where a published outcome ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReceipt {
    /// Acknowledged on the output topic
    Delivered { partition: i32, offset: i64 },
    /// Output topic refused it; the dead-letter topic took it instead
    DeadLettered {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl DeliveryReceipt {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, DeliveryReceipt::DeadLettered { .. })
    }
}

/// Source of input records.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next record.
    async fn next_message(&self) -> Result<InboundMessage>;

    /// Mark everything up to and including `position` as processed.
    async fn commit(&self, position: &SourcePosition) -> Result<()>;
}

/// Destination for enriched outcomes.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Publish one outcome produced from the record at `source`.
    ///
    /// Resolves once the broker has acknowledged the record; an error means
    /// the record is not durable anywhere.
    async fn publish(
        &self,
        outcome: &EnrichedOutcome,
        source: &SourcePosition,
    ) -> Result<DeliveryReceipt>;
}

/// Apply SASL/SSL settings shared by the consumer and producer.
pub(crate) fn apply_security(client_config: &mut ClientConfig, security: &KafkaSecurityConfig) {
    if let Some(ref protocol) = security.protocol {
        client_config.set("security.protocol", protocol);
    }
    if let Some(ref mechanism) = security.sasl_mechanism {
        client_config.set("sasl.mechanism", mechanism);
    }
    if let Some(ref username) = security.sasl_username {
        client_config.set("sasl.username", username);
    }
    if let Some(ref password) = security.sasl_password {
        client_config.set("sasl.password", password);
    }
    if let Some(ref path) = security.ssl_ca_location {
        client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
    }
}
