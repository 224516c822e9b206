//! Integration tests for fio-core.
//!
//! The `pipeline_flow` tests run the full pipeline against in-memory doubles.
//! The Kafka tests require Docker to be running and are marked with #[ignore]
//! to avoid running them in normal test runs.
//!
//! Run with: cargo test --test integration_tests -- --ignored

use async_trait::async_trait;
use fio_core::config::LookupStrategy;
use fio_core::engine::{Enricher, EnrichmentPipeline};
use fio_core::health::{Component, ComponentStatus, HealthCheck};
use fio_core::kafka::{
    DeliveryReceipt, InboundMessage, MessageSource, OutcomeSink, SourcePosition,
};
use fio_core::lookup::{Attribute, AttributeLookup, AttributeValue, LookupResult};
use fio_core::metrics::{PipelineMetrics, RESULT_ENRICHED};
use fio_core::model::EnrichedOutcome;
use fio_core::retry::RetryConfig;
use fio_core::{Error, KafkaError, LookupError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// === TEST DOUBLES ===

/// Source fed through a channel; blocks forever once drained.
struct QueueSource {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<InboundMessage>>>,
    commits: Mutex<Vec<SourcePosition>>,
}

impl QueueSource {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<InboundMessage>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(Self {
            rx: tokio::sync::Mutex::new(rx),
            commits: Mutex::new(Vec::new()),
        });
        (source, tx)
    }

    fn committed_offsets(&self, partition: i32) -> Vec<i64> {
        self.commits
            .lock()
            .iter()
            .filter(|p| p.partition == partition)
            .map(|p| p.offset)
            .collect()
    }
}

#[async_trait]
impl MessageSource for QueueSource {
    async fn next_message(&self) -> Result<InboundMessage> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(next) => next,
            None => std::future::pending().await,
        }
    }

    async fn commit(&self, position: &SourcePosition) -> Result<()> {
        self.commits.lock().push(position.clone());
        Ok(())
    }
}

/// Sink that records outcomes; selected offsets fail or get dead-lettered.
#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(serde_json::Value, SourcePosition)>>,
    fail_offsets: HashSet<i64>,
    dead_letter_offsets: HashSet<i64>,
}

impl RecordingSink {
    fn published(&self) -> Vec<serde_json::Value> {
        self.published.lock().iter().map(|(v, _)| v.clone()).collect()
    }

    fn len(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl OutcomeSink for RecordingSink {
    async fn publish(
        &self,
        outcome: &EnrichedOutcome,
        source: &SourcePosition,
    ) -> Result<DeliveryReceipt> {
        if self.fail_offsets.contains(&source.offset) {
            return Err(Error::Kafka(KafkaError::DeliveryFailed {
                topic: "FIO_ENRICHED".into(),
                attempts: 3,
                message: "Local: Message timed out".into(),
            }));
        }

        let wire: serde_json::Value = serde_json::from_slice(&outcome.to_json_bytes()?)?;
        let offset = self.len() as i64;
        self.published.lock().push((wire, source.clone()));

        if self.dead_letter_offsets.contains(&source.offset) {
            Ok(DeliveryReceipt::DeadLettered {
                topic: "FIO_DLQ".into(),
                partition: 0,
                offset,
            })
        } else {
            Ok(DeliveryReceipt::Delivered {
                partition: 0,
                offset,
            })
        }
    }
}

/// Lookup double answering fixed values, failing per name and attribute.
struct FakeLookup {
    failures: HashMap<(&'static str, Attribute), LookupError>,
    calls: HashMap<Attribute, AtomicUsize>,
}

impl FakeLookup {
    fn new() -> Self {
        Self {
            failures: HashMap::new(),
            calls: Attribute::ALL
                .iter()
                .map(|a| (*a, AtomicUsize::new(0)))
                .collect(),
        }
    }

    fn failing(mut self, name: &'static str, attribute: Attribute, error: LookupError) -> Self {
        self.failures.insert((name, attribute), error);
        self
    }

    fn calls(&self, attribute: Attribute) -> usize {
        self.calls[&attribute].load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttributeLookup for FakeLookup {
    async fn fetch(&self, attribute: Attribute, name: &str) -> LookupResult {
        self.calls[&attribute].fetch_add(1, Ordering::SeqCst);
        if let Some((_, err)) = self
            .failures
            .iter()
            .find(|((n, a), _)| *n == name && *a == attribute)
        {
            return Err(err.clone());
        }
        Ok(match attribute {
            Attribute::Age => AttributeValue::Age(30),
            Attribute::Gender => AttributeValue::Gender("female".into()),
            Attribute::Nationality => AttributeValue::Nationality("RU".into()),
        })
    }
}

fn message(partition: i32, offset: i64, value: &[u8]) -> InboundMessage {
    InboundMessage {
        value: Some(value.to_vec()),
        ..tombstone(partition, offset)
    }
}

fn tombstone(partition: i32, offset: i64) -> InboundMessage {
    InboundMessage {
        key: None,
        value: None,
        topic: "FIO".to_string(),
        partition,
        offset,
        timestamp: 1_700_000_000_000,
        headers: vec![],
    }
}

struct Harness {
    pipeline: EnrichmentPipeline,
    source: Arc<QueueSource>,
    tx: mpsc::UnboundedSender<Result<InboundMessage>>,
    sink: Arc<RecordingSink>,
    lookup: Arc<FakeLookup>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
}

fn harness(lookup: FakeLookup, sink: RecordingSink, strategy: LookupStrategy) -> Harness {
    let (source, tx) = QueueSource::new();
    let sink = Arc::new(sink);
    let lookup = Arc::new(lookup);
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let health = Arc::new(HealthCheck::new());

    let pipeline = EnrichmentPipeline::new(
        source.clone(),
        sink.clone(),
        Enricher::new(lookup.clone(), strategy),
        metrics.clone(),
        health.clone(),
    )
    .with_read_retry(RetryConfig::new(
        Duration::from_millis(1),
        Duration::from_millis(5),
        u32::MAX,
    ));

    Harness {
        pipeline,
        source,
        tx,
        sink,
        lookup,
        metrics,
        health,
    }
}

async fn wait_for(sink: &RecordingSink, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for published outcomes");
}

mod pipeline_flow {
    use super::*;

    /// Every read message yields exactly one outcome, in input order.
    #[tokio::test]
    async fn test_one_outcome_per_message_in_order() {
        let lookup = FakeLookup::new().failing(
            "Bob",
            Attribute::Gender,
            LookupError::Transport("connection refused".into()),
        );
        let mut h = harness(lookup, RecordingSink::default(), LookupStrategy::Sequential);

        let inputs = vec![
            message(0, 0, br#"{"name":"Anna","surname":"Ivanova"}"#),
            message(0, 1, b"not-json"),
            message(0, 2, br#"{"name":"Bob","surname":"Lee"}"#),
            tombstone(0, 3),
            message(0, 4, br#"{"name":"Anna","surname":"Ivanova","patronymic":"Petrovna"}"#),
        ];
        for msg in inputs {
            h.pipeline.process_message(msg).await.unwrap();
        }

        let published = h.sink.published();
        assert_eq!(published.len(), 5);

        assert_eq!(
            published[0],
            serde_json::json!({
                "name": "Anna",
                "surname": "Ivanova",
                "age": 30,
                "gender": "female",
                "nationality": "RU"
            })
        );

        assert_eq!(published[1]["error"], "invalid_message");
        assert!(!published[1]["error_message"].as_str().unwrap().is_empty());
        assert!(published[1].get("name").is_none());
        assert!(published[1].get("surname").is_none());

        assert_eq!(
            published[2],
            serde_json::json!({
                "name": "Bob",
                "surname": "Lee",
                "error": "enrichment_failed",
                "error_message": "Failed to get gender: transport error: connection refused"
            })
        );

        assert_eq!(published[3]["error"], "invalid_message");
        assert_eq!(published[4]["patronymic"], "Petrovna");

        // No outcome mixes an error with attributes
        for outcome in &published {
            if outcome.get("error").is_some() {
                assert!(outcome.get("age").is_none());
                assert!(outcome.get("gender").is_none());
                assert!(outcome.get("nationality").is_none());
            }
        }

        assert_eq!(h.source.committed_offsets(0), vec![0, 1, 2, 3, 4]);
        assert_eq!(h.metrics.outcomes(RESULT_ENRICHED), 2);
        assert_eq!(h.metrics.outcomes("invalid_message"), 2);
        assert_eq!(h.metrics.outcomes("enrichment_failed"), 1);
        assert_eq!(h.metrics.lookup_failures(Attribute::Gender), 1);
    }

    #[tokio::test]
    async fn test_age_failure_skips_remaining_lookups() {
        let lookup = FakeLookup::new().failing("Zed", Attribute::Age, LookupError::Timeout(2000));
        let mut h = harness(lookup, RecordingSink::default(), LookupStrategy::Sequential);

        h.pipeline
            .process_message(message(0, 0, br#"{"name":"Zed","surname":"Z"}"#))
            .await
            .unwrap();

        assert_eq!(h.lookup.calls(Attribute::Age), 1);
        assert_eq!(h.lookup.calls(Attribute::Gender), 0);
        assert_eq!(h.lookup.calls(Attribute::Nationality), 0);
        assert_eq!(
            h.sink.published()[0]["error_message"],
            "Failed to get age: request timed out after 2000ms"
        );
        assert!(matches!(
            h.health.component_status(Component::Lookup),
            ComponentStatus::Degraded(_)
        ));
    }

    #[tokio::test]
    async fn test_positional_array_is_invalid_message() {
        let mut h = harness(
            FakeLookup::new(),
            RecordingSink::default(),
            LookupStrategy::Sequential,
        );

        h.pipeline
            .process_message(message(0, 0, br#"["Anna","Ivanova","Petrovna"]"#))
            .await
            .unwrap();

        for attribute in Attribute::ALL {
            assert_eq!(h.lookup.calls(attribute), 0);
        }
        let published = h.sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["error"], "invalid_message");
        assert_eq!(
            published[0]["error_message"],
            "expected a JSON object, got an array"
        );
        assert!(published[0].get("name").is_none());
        assert_eq!(h.source.committed_offsets(0), vec![0]);
        assert_eq!(h.metrics.outcomes("invalid_message"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_strategy_discards_partial_results() {
        let lookup = FakeLookup::new().failing(
            "Bob",
            Attribute::Gender,
            LookupError::Transport("connection refused".into()),
        );
        let mut h = harness(lookup, RecordingSink::default(), LookupStrategy::Concurrent);

        h.pipeline
            .process_message(message(0, 0, br#"{"name":"Bob","surname":"Lee"}"#))
            .await
            .unwrap();

        let outcome = &h.sink.published()[0];
        assert_eq!(outcome["error"], "enrichment_failed");
        assert!(outcome.get("age").is_none());
        // all three were issued
        assert_eq!(h.lookup.calls(Attribute::Nationality), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_holds_partition_commits() {
        let sink = RecordingSink {
            fail_offsets: HashSet::from([1]),
            ..Default::default()
        };
        let mut h = harness(FakeLookup::new(), sink, LookupStrategy::Sequential);
        let anna: &[u8] = br#"{"name":"Anna","surname":"Ivanova"}"#;

        h.pipeline.process_message(message(0, 0, anna)).await.unwrap();
        let err = h
            .pipeline
            .process_message(message(0, 1, anna))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Kafka(KafkaError::DeliveryFailed { attempts: 3, .. })
        ));
        h.pipeline.process_message(message(0, 2, anna)).await.unwrap();
        h.pipeline.process_message(message(1, 7, anna)).await.unwrap();

        // Offset 2 is published but not committed past the undelivered offset 1
        assert_eq!(h.sink.len(), 3);
        assert_eq!(h.source.committed_offsets(0), vec![0]);
        assert_eq!(h.source.committed_offsets(1), vec![7]);
        assert!(h.pipeline.is_commit_held("FIO", 0));
        assert!(!h.pipeline.is_commit_held("FIO", 1));

        assert_eq!(h.metrics.delivery_failures(), 1);
        assert!(matches!(
            h.health.component_status(Component::Publisher),
            ComponentStatus::Healthy
        ));
    }

    #[tokio::test]
    async fn test_dead_lettered_outcome_is_committed() {
        let sink = RecordingSink {
            dead_letter_offsets: HashSet::from([4]),
            ..Default::default()
        };
        let mut h = harness(FakeLookup::new(), sink, LookupStrategy::Sequential);

        let receipt = h
            .pipeline
            .process_message(message(0, 4, br#"{"name":"Anna","surname":"I"}"#))
            .await
            .unwrap();

        assert!(receipt.is_dead_lettered());
        assert_eq!(h.source.committed_offsets(0), vec![4]);
        assert_eq!(h.metrics.dead_lettered(), 1);
        assert_eq!(h.metrics.outcomes(RESULT_ENRICHED), 0);
        assert!(matches!(
            h.health.component_status(Component::Publisher),
            ComponentStatus::Degraded(_)
        ));
    }

    /// Read errors are counted and skipped; shutdown stops the loop.
    #[tokio::test]
    async fn test_run_survives_read_errors_until_shutdown() {
        let h = harness(FakeLookup::new(), RecordingSink::default(), LookupStrategy::Sequential);
        let Harness {
            mut pipeline,
            tx,
            sink,
            metrics,
            health,
            ..
        } = h;
        let read_error = || -> Result<InboundMessage> {
            Err(Error::Kafka(KafkaError::Read("Broker transport failure".into())))
        };

        tx.send(read_error()).unwrap();
        tx.send(Ok(message(0, 0, br#"{"name":"Anna","surname":"I"}"#)))
            .unwrap();
        tx.send(read_error()).unwrap();
        tx.send(Ok(message(0, 1, b"{}"))).unwrap();

        let shutdown = pipeline.shutdown_signal();
        let handle = tokio::spawn(async move { pipeline.run().await });

        wait_for(&sink, 2).await;
        assert!(health.is_running());
        assert!(health.is_ready());

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipeline did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(metrics.read_errors(), 2);
        assert_eq!(metrics.messages_consumed(), 2);
        assert_eq!(sink.published()[1]["error"], "invalid_message");
        assert!(!health.is_running());
    }

    /// Shutdown interrupts a read that is waiting for input.
    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_read() {
        let h = harness(FakeLookup::new(), RecordingSink::default(), LookupStrategy::Sequential);
        let Harness { mut pipeline, health, .. } = h;

        let shutdown = pipeline.shutdown_signal();
        let handle = tokio::spawn(async move { pipeline.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !health.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipeline did not stop")
            .unwrap()
            .unwrap();
    }

    /// A signal fired before the loop starts still stops it.
    #[tokio::test]
    async fn test_shutdown_sent_before_run_is_honored() {
        let h = harness(FakeLookup::new(), RecordingSink::default(), LookupStrategy::Sequential);
        let Harness { mut pipeline, tx, sink, .. } = h;

        let shutdown = pipeline.shutdown_signal();
        shutdown.send(()).unwrap();
        tx.send(Ok(message(0, 0, br#"{"name":"Anna","surname":"Ivanova"}"#)))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.run())
            .await
            .expect("pipeline did not stop")
            .unwrap();
        assert_eq!(sink.len(), 0);
    }
}

mod config_integration {
    use fio_core::config::{Config, LookupStrategy, OffsetReset};
    use std::io::Write;

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[kafka]
bootstrap_servers = ["kafka-1:9092", "kafka-2:9092"]
consumer_group = "fio-enricher"
auto_offset_reset = "latest"

[publisher]
dead_letter_topic = "FIO_DLQ"

[lookup]
strategy = "concurrent"
request_timeout_ms = 800
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.kafka.brokers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.kafka.input_topic, "FIO");
        assert_eq!(config.kafka.output_topic, "FIO_ENRICHED");
        assert_eq!(config.kafka.auto_offset_reset, OffsetReset::Latest);
        assert_eq!(config.publisher.dead_letter_topic.as_deref(), Some("FIO_DLQ"));
        assert_eq!(config.lookup.strategy, LookupStrategy::Concurrent);
        assert_eq!(config.lookup.request_timeout_ms, 800);
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let config = Config::from_toml(include_str!("../../../config.example.toml")).unwrap();
        let defaults = Config::default();

        assert_eq!(config.kafka.brokers(), defaults.kafka.brokers());
        assert_eq!(config.kafka.input_topic, defaults.kafka.input_topic);
        assert_eq!(config.lookup.age_url, defaults.lookup.age_url);
        assert_eq!(config.lookup.retry, defaults.lookup.retry);
        assert_eq!(config.publisher.retry, defaults.publisher.retry);
        assert_eq!(
            config.publisher.dead_letter_topic.as_deref(),
            Some("FIO_ENRICHED_DLQ")
        );
    }
}

mod kafka_integration {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use fio_core::config::{KafkaConfig, LookupConfig, OffsetReset, PublisherConfig};
    use fio_core::kafka::{IdentityConsumer, OutcomePublisher};
    use fio_core::lookup::HttpLookupClient;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::message::Message;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::kafka::Kafka;

    async fn spawn_lookup_services() -> String {
        type Params = Query<HashMap<String, String>>;
        let router = Router::new()
            .route(
                "/age",
                get(|_: Params| async { Json(serde_json::json!({ "age": 30 })) }),
            )
            .route(
                "/gender",
                get(|_: Params| async { Json(serde_json::json!({ "gender": "female" })) }),
            )
            .route(
                "/nationality",
                get(|_: Params| async { Json(serde_json::json!({ "nationality": "RU" })) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Records produced to the input topic come out enriched on the output topic.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_end_to_end_enrichment() {
        let kafka = Kafka::default()
            .start()
            .await
            .expect("Failed to start Kafka container");
        let bootstrap_servers = format!(
            "127.0.0.1:{}",
            kafka
                .get_host_port_ipv4(9093)
                .await
                .expect("Failed to get Kafka port")
        );

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .create()
            .expect("Failed to create admin client");
        let topics = [
            NewTopic::new("FIO", 1, TopicReplication::Fixed(1)),
            NewTopic::new("FIO_ENRICHED", 1, TopicReplication::Fixed(1)),
        ];
        admin
            .create_topics(&topics, &AdminOptions::new())
            .await
            .expect("Failed to create topics");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        let payloads: [&[u8]; 2] = [br#"{"name":"Anna","surname":"Ivanova"}"#, b"not-json"];
        for payload in payloads {
            producer
                .send(
                    FutureRecord::<(), [u8]>::to("FIO").payload(payload),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to produce message");
        }

        let kafka_config = KafkaConfig {
            bootstrap_servers: vec![bootstrap_servers.clone()],
            auto_offset_reset: OffsetReset::Earliest,
            ..Default::default()
        };
        let base = spawn_lookup_services().await;
        let lookup_config = LookupConfig {
            age_url: format!("{}/age", base),
            gender_url: format!("{}/gender", base),
            nationality_url: format!("{}/nationality", base),
            ..Default::default()
        };

        let source = Arc::new(IdentityConsumer::new(&kafka_config).unwrap());
        let publisher = Arc::new(
            OutcomePublisher::new(&kafka_config, &PublisherConfig::default()).unwrap(),
        );
        let lookup = Arc::new(HttpLookupClient::new(&lookup_config).unwrap());
        let mut pipeline = EnrichmentPipeline::new(
            source,
            publisher.clone(),
            Enricher::new(lookup, LookupStrategy::Sequential),
            Arc::new(PipelineMetrics::new().unwrap()),
            Arc::new(HealthCheck::new()),
        );
        let shutdown = pipeline.shutdown_signal();
        let handle = tokio::spawn(async move { pipeline.run().await });

        let reader: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("group.id", "fio-test-reader")
            .set("auto.offset.reset", "earliest")
            .create()
            .expect("Failed to create reader");
        reader.subscribe(&["FIO_ENRICHED"]).unwrap();

        let mut outcomes = Vec::new();
        while outcomes.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(30), reader.recv())
                .await
                .expect("timed out reading output topic")
                .expect("Failed to read output topic");
            let value: serde_json::Value =
                serde_json::from_slice(msg.payload().unwrap()).unwrap();
            outcomes.push(value);
        }

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
        publisher.flush().unwrap();

        assert_eq!(outcomes[0]["name"], "Anna");
        assert_eq!(outcomes[0]["age"], 30);
        assert_eq!(outcomes[0]["nationality"], "RU");
        assert_eq!(outcomes[1]["error"], "invalid_message");
    }
}
