//! Producer for the output topic.
//!
//! One long-lived idempotent producer is shared by the whole pipeline.
//! Transient broker errors are retried with backoff; once retries are used
//! up the outcome is wrapped in a [`DeadLetter`] envelope and sent to the
//! dead-letter topic, when one is configured.

use super::{apply_security, DeliveryReceipt, OutcomeSink, SourcePosition};
use crate::config::{KafkaConfig, PublisherConfig};
use crate::model::{EnrichedOutcome, ErrorKind};
use crate::retry::RetryConfig;
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Envelope written to the dead-letter topic for an undeliverable outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Always `delivery_error`
    pub error: ErrorKind,
    pub error_message: String,
    /// Send attempts made against the output topic
    pub attempts: u32,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub failed_at: DateTime<Utc>,
    /// The outcome that could not be delivered, as it would have been published
    pub payload: serde_json::Value,
}

impl DeadLetter {
    pub fn new(
        outcome: &EnrichedOutcome,
        source: &SourcePosition,
        attempts: u32,
        message: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            error: ErrorKind::DeliveryError,
            error_message: message.into(),
            attempts,
            source_topic: source.topic.clone(),
            source_partition: source.partition,
            source_offset: source.offset,
            failed_at: Utc::now(),
            payload: serde_json::to_value(outcome)?,
        })
    }
}

/// Kafka producer publishing [`EnrichedOutcome`] records.
pub struct OutcomePublisher {
    producer: FutureProducer,
    output_topic: String,
    dead_letter_topic: Option<String>,
    message_timeout: Duration,
    flush_timeout: Duration,
    retry: RetryConfig,
}

impl OutcomePublisher {
    /// Create the producer.
    pub fn new(kafka: &KafkaConfig, publisher: &PublisherConfig) -> Result<Self> {
        let producer: FutureProducer =
            Self::client_config(kafka, publisher)
                .create()
                .map_err(|e| {
                    Error::Kafka(KafkaError::ConnectionFailed {
                        broker: kafka.brokers(),
                        message: e.to_string(),
                    })
                })?;

        info!(
            topic = %kafka.output_topic,
            dead_letter_topic = ?publisher.dead_letter_topic,
            acks = %publisher.acks,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            output_topic: kafka.output_topic.clone(),
            dead_letter_topic: publisher.dead_letter_topic.clone(),
            message_timeout: publisher.message_timeout(),
            flush_timeout: publisher.flush_timeout(),
            retry: publisher.retry.clone(),
        })
    }

    fn client_config(kafka: &KafkaConfig, publisher: &PublisherConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", kafka.brokers())
            .set("acks", &publisher.acks)
            .set(
                "message.timeout.ms",
                publisher.message_timeout_ms.to_string(),
            )
            .set("compression.type", "lz4");

        // Idempotence requires acks=all
        if publisher.acks == "all" || publisher.acks == "-1" {
            client_config.set("enable.idempotence", "true");
        }

        apply_security(&mut client_config, &kafka.security);
        client_config
    }

    /// Output topic name.
    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }

    /// Records queued but not yet acknowledged.
    pub fn in_flight(&self) -> i32 {
        self.producer.in_flight_count()
    }

    /// Block until queued records are delivered or the flush timeout passes.
    pub fn flush(&self) -> Result<()> {
        let pending = self.in_flight();
        self.producer.flush(self.flush_timeout).map_err(|e| {
            Error::Kafka(KafkaError::DeliveryFailed {
                topic: self.output_topic.clone(),
                attempts: 1,
                message: format!("flush with {} records in flight: {}", pending, e),
            })
        })?;
        info!(flushed = pending, "Kafka producer flushed");
        Ok(())
    }

    async fn send_once(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> std::result::Result<(i32, i64), RdKafkaError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);
        self.producer
            .send(record, self.message_timeout)
            .await
            .map_err(|(e, _)| e)
    }

    async fn send_with_retry(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> std::result::Result<(i32, i64), (RdKafkaError, u32)> {
        self.retry
            .run(
                topic,
                || self.send_once(topic, payload),
                is_retryable_send_error,
            )
            .await
    }

    async fn dead_letter(
        &self,
        topic: &str,
        outcome: &EnrichedOutcome,
        source: &SourcePosition,
        attempts: u32,
        cause: &RdKafkaError,
    ) -> Result<DeliveryReceipt> {
        let message = format!("delivery to {} failed: {}", self.output_topic, cause);
        let envelope = DeadLetter::new(outcome, source, attempts, message)?;
        let payload = serde_json::to_vec(&envelope)?;

        match self.send_with_retry(topic, &payload).await {
            Ok((partition, offset)) => {
                warn!(
                    source = %source,
                    dead_letter_topic = %topic,
                    partition = partition,
                    offset = offset,
                    attempts = attempts,
                    "Outcome dead-lettered"
                );
                Ok(DeliveryReceipt::DeadLettered {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            }
            Err((e, dlq_attempts)) => {
                error!(
                    source = %source,
                    dead_letter_topic = %topic,
                    error = %e,
                    "Dead-letter delivery failed"
                );
                Err(Error::Kafka(KafkaError::DeliveryFailed {
                    topic: topic.to_string(),
                    attempts: dlq_attempts,
                    message: format!("{}; output topic error: {}", e, cause),
                }))
            }
        }
    }
}

#[async_trait]
impl OutcomeSink for OutcomePublisher {
    async fn publish(
        &self,
        outcome: &EnrichedOutcome,
        source: &SourcePosition,
    ) -> Result<DeliveryReceipt> {
        let payload = outcome.to_json_bytes()?;

        match self.send_with_retry(&self.output_topic, &payload).await {
            Ok((partition, offset)) => {
                debug!(
                    source = %source,
                    topic = %self.output_topic,
                    partition = partition,
                    offset = offset,
                    result = outcome.result_label(),
                    "Outcome delivered"
                );
                Ok(DeliveryReceipt::Delivered { partition, offset })
            }
            Err((e, attempts)) => match self.dead_letter_topic.as_deref() {
                Some(topic) => {
                    self.dead_letter(topic, outcome, source, attempts, &e)
                        .await
                }
                None => Err(Error::Kafka(KafkaError::DeliveryFailed {
                    topic: self.output_topic.clone(),
                    attempts,
                    message: e.to_string(),
                })),
            },
        }
    }
}

/// Whether a produce error may succeed on a later attempt.
fn is_retryable_send_error(error: &RdKafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
        )
    )
}
