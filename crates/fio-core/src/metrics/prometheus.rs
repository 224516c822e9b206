//! Prometheus metrics for the enrichment pipeline.

use crate::lookup::Attribute;
use crate::model::ErrorKind;
use crate::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Bucket boundaries in seconds for per-record processing time.
const PROCESSING_DURATION_BUCKETS: [f64; 9] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Label value for records published without an error.
pub const RESULT_ENRICHED: &str = "enriched";

/// Pipeline counters and histograms, registered in a private registry.
pub struct PipelineMetrics {
    registry: Registry,
    messages_consumed: IntCounter,
    outcomes: IntCounterVec,
    read_errors: IntCounter,
    lookup_failures: IntCounterVec,
    delivery_failures: IntCounter,
    dead_lettered: IntCounter,
    commit_failures: IntCounter,
    processing_duration: Histogram,
}

impl PipelineMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_consumed = IntCounter::new(
            "fio_messages_consumed_total",
            "Records read from the input topic",
        )?;
        let outcomes = IntCounterVec::new(
            Opts::new("fio_outcomes_total", "Outcomes published, by result"),
            &["result"],
        )?;
        let read_errors = IntCounter::new(
            "fio_read_errors_total",
            "Failed reads from the input topic",
        )?;
        let lookup_failures = IntCounterVec::new(
            Opts::new(
                "fio_lookup_failures_total",
                "Enrichments failed, by the attribute whose lookup failed",
            ),
            &["attribute"],
        )?;
        let delivery_failures = IntCounter::new(
            "fio_delivery_failures_total",
            "Outcomes that could not be delivered anywhere",
        )?;
        let dead_lettered = IntCounter::new(
            "fio_dead_lettered_total",
            "Outcomes written to the dead-letter topic",
        )?;
        let commit_failures = IntCounter::new(
            "fio_commit_failures_total",
            "Failed input offset commits",
        )?;
        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fio_processing_duration_seconds",
                "Time from read to acknowledged publish for one record",
            )
            .buckets(PROCESSING_DURATION_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(messages_consumed.clone()))?;
        registry.register(Box::new(outcomes.clone()))?;
        registry.register(Box::new(read_errors.clone()))?;
        registry.register(Box::new(lookup_failures.clone()))?;
        registry.register(Box::new(delivery_failures.clone()))?;
        registry.register(Box::new(dead_lettered.clone()))?;
        registry.register(Box::new(commit_failures.clone()))?;
        registry.register(Box::new(processing_duration.clone()))?;

        // Expose every series from the first scrape
        for result in [
            RESULT_ENRICHED,
            ErrorKind::InvalidMessage.as_str(),
            ErrorKind::EnrichmentFailed.as_str(),
        ] {
            outcomes.with_label_values(&[result]);
        }
        for attribute in Attribute::ALL {
            lookup_failures.with_label_values(&[attribute.as_str()]);
        }

        Ok(Self {
            registry,
            messages_consumed,
            outcomes,
            read_errors,
            lookup_failures,
            delivery_failures,
            dead_lettered,
            commit_failures,
            processing_duration,
        })
    }

    pub fn record_consumed(&self) {
        self.messages_consumed.inc();
    }

    /// Record a published outcome under its result label.
    pub fn record_outcome(&self, result: &str) {
        self.outcomes.with_label_values(&[result]).inc();
    }

    pub fn record_read_error(&self) {
        self.read_errors.inc();
    }

    pub fn record_lookup_failure(&self, attribute: Attribute) {
        self.lookup_failures
            .with_label_values(&[attribute.as_str()])
            .inc();
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.inc();
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.inc();
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.inc();
    }

    pub fn observe_processing(&self, elapsed: Duration) {
        self.processing_duration.observe(elapsed.as_secs_f64());
    }

    // === GETTERS ===

    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed.get()
    }

    pub fn outcomes(&self, result: &str) -> u64 {
        self.outcomes.with_label_values(&[result]).get()
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.get()
    }

    pub fn lookup_failures(&self, attribute: Attribute) -> u64 {
        self.lookup_failures
            .with_label_values(&[attribute.as_str()])
            .get()
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.get()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.get()
    }

    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.get()
    }

    pub fn processed_count(&self) -> u64 {
        self.processing_duration.get_sample_count()
    }

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus_text(&self) -> Result<String> {
        let mut buffer = Vec::with_capacity(4096);
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Metrics(e.to_string()))
    }
}
