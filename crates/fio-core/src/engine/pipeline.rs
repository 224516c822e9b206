//! The consume → enrich → publish → commit loop.
//!
//! One record is fully processed before the next is read, so outcomes are
//! published in input order. A shutdown signal is raced against every step
//! and interrupts an in-flight read, lookup or publish; the interrupted
//! record is left uncommitted and will be redelivered.
//!
//! Kafka commits are positional: committing offset `n` also covers every
//! earlier offset of the partition. After an outcome fails to be delivered,
//! commits for that partition are held for the rest of the run so the failed
//! record is read again after a restart.

use super::enricher::{Enricher, Enrichment};
use crate::health::{Component, HealthCheck};
use crate::kafka::{DeliveryReceipt, InboundMessage, MessageSource, OutcomeSink, SourcePosition};
use crate::metrics::PipelineMetrics;
use crate::model::{EnrichedOutcome, Identity};
use crate::retry::RetryConfig;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Enrichment pipeline over a message source and an outcome sink.
pub struct EnrichmentPipeline {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn OutcomeSink>,
    enricher: Enricher,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
    read_retry: RetryConfig,
    shutdown_tx: broadcast::Sender<()>,
    /// Subscribed at construction so signals sent before `run` are kept
    shutdown_rx: Option<broadcast::Receiver<()>>,
    consecutive_read_failures: u32,
    /// First undelivered offset per (topic, partition)
    held_commits: HashMap<(String, i32), i64>,
}

impl EnrichmentPipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn OutcomeSink>,
        enricher: Enricher,
        metrics: Arc<PipelineMetrics>,
        health: Arc<HealthCheck>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            source,
            sink,
            enricher,
            metrics,
            health,
            read_retry: RetryConfig::for_reads(),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            consecutive_read_failures: 0,
            held_commits: HashMap::new(),
        }
    }

    /// Backoff applied between failed reads.
    pub fn with_read_retry(mut self, read_retry: RetryConfig) -> Self {
        self.read_retry = read_retry;
        self
    }

    /// Run until a shutdown signal is received.
    pub async fn run(&mut self) -> Result<()> {
        self.health.pipeline_started();
        info!(strategy = ?self.enricher.strategy(), "Enrichment pipeline started");

        let mut shutdown_rx = match self.shutdown_rx.take() {
            Some(rx) => rx,
            None => self.shutdown_tx.subscribe(),
        };

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = self.step() => {}
            }
        }

        self.health.pipeline_stopped();
        info!(
            consumed = self.metrics.messages_consumed(),
            processed = self.metrics.processed_count(),
            held_partitions = self.held_commits.len(),
            "Enrichment pipeline stopped"
        );
        Ok(())
    }

    /// Read one record and process it, or back off after a failed read.
    async fn step(&mut self) {
        match self.source.next_message().await {
            Ok(msg) => {
                self.consecutive_read_failures = 0;
                self.health.mark_healthy(Component::Consumer);
                self.metrics.record_consumed();
                // Delivery failures are already logged and counted
                let _ = self.process_message(msg).await;
            }
            Err(e) => {
                self.consecutive_read_failures = self.consecutive_read_failures.saturating_add(1);
                self.metrics.record_read_error();
                self.health
                    .mark_unhealthy(Component::Consumer, e.to_string());

                let delay = self
                    .read_retry
                    .calculate_delay(self.consecutive_read_failures - 1);
                warn!(
                    error = %e,
                    failures = self.consecutive_read_failures,
                    backoff_ms = delay.as_millis() as u64,
                    "Read from input topic failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Turn one inbound record into an outcome, publish it, and commit it.
    ///
    /// Returns an error only when the outcome could not be delivered
    /// anywhere; the record is then left uncommitted.
    pub async fn process_message(&mut self, msg: InboundMessage) -> Result<DeliveryReceipt> {
        let started = Instant::now();
        let position = msg.position();

        let outcome = match Identity::decode(msg.value.as_deref()) {
            Ok(identity) => self.enrich(identity).await,
            Err(failure) => {
                warn!(source = %position, error = %failure.message, "Invalid input message");
                EnrichedOutcome::invalid_message(failure)
            }
        };

        let receipt = match self.sink.publish(&outcome, &position).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.metrics.record_delivery_failure();
                self.health
                    .mark_unhealthy(Component::Publisher, e.to_string());
                self.hold_commits(&position);
                error!(
                    source = %position,
                    error = %e,
                    "Outcome not delivered, offset left uncommitted"
                );
                return Err(e);
            }
        };

        match &receipt {
            DeliveryReceipt::Delivered { .. } => {
                self.metrics.record_outcome(outcome.result_label());
                self.health.mark_healthy(Component::Publisher);
            }
            DeliveryReceipt::DeadLettered { topic, .. } => {
                self.metrics.record_dead_lettered();
                self.health.mark_degraded(
                    Component::Publisher,
                    format!("outcome for {} dead-lettered to {}", position, topic),
                );
            }
        }

        self.commit(&position).await;
        self.metrics.observe_processing(started.elapsed());
        Ok(receipt)
    }

    async fn enrich(&self, identity: Identity) -> EnrichedOutcome {
        let enrichment = self.enricher.resolve(&identity.name).await;

        match &enrichment {
            Enrichment::AllSucceeded(_) => self.health.mark_healthy(Component::Lookup),
            Enrichment::AnyFailed(failure) => {
                self.metrics.record_lookup_failure(failure.attribute);
                self.health
                    .mark_degraded(Component::Lookup, failure.to_string());
                warn!(
                    name = %identity.name,
                    attribute = %failure.attribute,
                    error = %failure.error,
                    "Enrichment failed"
                );
            }
        }

        Enricher::into_outcome(identity, enrichment)
    }

    async fn commit(&self, position: &SourcePosition) {
        let key = (position.topic.clone(), position.partition);
        if let Some(held_at) = self.held_commits.get(&key) {
            debug!(
                source = %position,
                held_at = held_at,
                "Commit held behind undelivered record"
            );
            return;
        }

        if let Err(e) = self.source.commit(position).await {
            self.metrics.record_commit_failure();
            warn!(source = %position, error = %e, "Offset commit failed, record may be redelivered");
        }
    }

    fn hold_commits(&mut self, position: &SourcePosition) {
        self.held_commits
            .entry((position.topic.clone(), position.partition))
            .or_insert(position.offset);
    }

    /// Whether commits for a partition are held behind an undelivered record.
    pub fn is_commit_held(&self, topic: &str, partition: i32) -> bool {
        self.held_commits
            .contains_key(&(topic.to_string(), partition))
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Get shutdown signal sender.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
