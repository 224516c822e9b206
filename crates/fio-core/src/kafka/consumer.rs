//! Consumer for the input topic.
//!
//! Uses the CooperativeSticky assignor and manual offset commits: an offset
//! is committed only once its outcome is durable on the output side, which
//! gives at-least-once processing across restarts and rebalances.

use super::{apply_security, InboundMessage, MessageSource, SourcePosition};
use crate::config::KafkaConfig;
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

/// Kafka consumer reading identity records from the input topic.
pub struct IdentityConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl IdentityConsumer {
    /// Create the consumer and subscribe to `config.input_topic`.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let client_config = Self::client_config(config);

        let consumer: StreamConsumer = client_config.create().map_err(|e| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: config.brokers(),
                message: e.to_string(),
            })
        })?;

        consumer
            .subscribe(&[&config.input_topic])
            .map_err(|e| Error::Kafka(KafkaError::Subscription(e.to_string())))?;

        info!(
            topic = %config.input_topic,
            group = %config.consumer_group,
            servers = %config.brokers(),
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.input_topic.clone(),
        })
    }

    fn client_config(config: &KafkaConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", config.brokers())
            .set("group.id", &config.consumer_group)
            // Offsets are committed by the pipeline after publish
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", config.auto_offset_reset.as_str())
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set(
                "heartbeat.interval.ms",
                config.heartbeat_interval_ms.to_string(),
            )
            // Must exceed the slowest enrich + publish of a single record
            .set(
                "max.poll.interval.ms",
                config.max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky");

        apply_security(&mut client_config, &config.security);
        client_config
    }

    /// Subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current partition assignment.
    pub fn assignment(&self) -> Result<Vec<(String, i32)>> {
        let tpl = self
            .consumer
            .assignment()
            .map_err(|e| Error::Kafka(KafkaError::Subscription(e.to_string())))?;

        Ok(tpl
            .elements()
            .iter()
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect())
    }

    fn convert_message(msg: &BorrowedMessage<'_>) -> InboundMessage {
        InboundMessage {
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()),
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis().unwrap_or(0),
            headers: Self::extract_headers(msg),
        }
    }

    fn extract_headers(msg: &BorrowedMessage<'_>) -> Vec<(String, Vec<u8>)> {
        msg.headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (header.key.to_string(), header.value.unwrap_or(&[]).to_vec())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageSource for IdentityConsumer {
    async fn next_message(&self) -> Result<InboundMessage> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::Kafka(KafkaError::Read(e.to_string())))?;
        Ok(Self::convert_message(&msg))
    }

    async fn commit(&self, position: &SourcePosition) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        // Committed offset is the next offset to read
        tpl.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )
        .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;

        debug!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            "Offset committed"
        );

        Ok(())
    }
}
