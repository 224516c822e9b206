//! Run command implementation.

use crate::server::{start_server, ServerState};
use crate::RunOverrides;
use anyhow::{Context, Result};
use fio_core::engine::{Enricher, EnrichmentPipeline};
use fio_core::health::HealthCheck;
use fio_core::kafka::{IdentityConsumer, OutcomePublisher};
use fio_core::lookup::HttpLookupClient;
use fio_core::metrics::PipelineMetrics;
use fio_core::retry::RetryConfig;
use fio_core::Config;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Apply command-line overrides on top of the loaded config.
pub fn apply_overrides(config: &mut Config, overrides: RunOverrides) {
    if let Some(servers) = overrides.bootstrap_servers {
        config.kafka.bootstrap_servers = servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(topic) = overrides.input_topic {
        config.kafka.input_topic = topic;
    }
    if let Some(topic) = overrides.output_topic {
        config.kafka.output_topic = topic;
    }
    if let Some(group) = overrides.consumer_group {
        config.kafka.consumer_group = group;
    }
}

/// Run the enrichment pipeline until SIGINT or SIGTERM.
pub async fn run(mut config: Config, overrides: RunOverrides) -> Result<()> {
    apply_overrides(&mut config, overrides);
    config.validate()?;

    info!(
        input_topic = %config.kafka.input_topic,
        output_topic = %config.kafka.output_topic,
        group = %config.kafka.consumer_group,
        strategy = ?config.lookup.strategy,
        "Starting enrichment pipeline"
    );

    let lookup = Arc::new(HttpLookupClient::new(&config.lookup)?);
    let consumer = Arc::new(IdentityConsumer::new(&config.kafka)?);
    let publisher = Arc::new(OutcomePublisher::new(&config.kafka, &config.publisher)?);

    let metrics = Arc::new(PipelineMetrics::new()?);
    let health = Arc::new(HealthCheck::new());

    let mut pipeline = EnrichmentPipeline::new(
        consumer,
        publisher.clone(),
        Enricher::new(lookup, config.lookup.strategy),
        Arc::clone(&metrics),
        Arc::clone(&health),
    )
    .with_read_retry(RetryConfig::for_reads());
    let shutdown_tx = pipeline.shutdown_signal();

    let server_state = Arc::new(ServerState { health, metrics });
    tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        shutdown_tx.subscribe(),
    ));

    tokio::spawn(wait_for_signal(shutdown_tx));

    pipeline.run().await?;

    // A publish interrupted by shutdown may still sit in the producer queue
    let flusher = Arc::clone(&publisher);
    match tokio::task::spawn_blocking(move || flusher.flush())
        .await
        .context("Producer flush task failed")?
    {
        Ok(()) => {}
        Err(e) => warn!(error = %e, "Producer flush incomplete"),
    }

    info!("Enrichment pipeline stopped");
    Ok(())
}

/// Fire the shutdown signal on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}
