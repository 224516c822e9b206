//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    uptime_seconds: u64,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show health and metrics of a running enricher.
pub async fn run(url: &str, metrics_url: Option<&str>) -> Result<()> {
    let base = url.trim_end_matches('/');
    println!("Checking health at {}...\n", base);

    let health_url = format!("{}/health", base);
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the enricher running?");
            println!("Start it with: fio-enricher run --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = match metrics_url {
        Some(explicit) => explicit.trim_end_matches('/').to_string(),
        None => default_metrics_url(base),
    };

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&parse_metrics(&text));
        }
        Err(e) => println!("Failed to fetch metrics: {}", e),
    }

    Ok(())
}

/// Health URL with the default health port swapped for the metrics port.
fn default_metrics_url(health_base: &str) -> String {
    format!("{}/metrics", health_base.replace(":8080", ":9090"))
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {}), up {}s",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code,
        health.uptime_seconds
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = status_tag(&status.status);
            match &status.message {
                Some(msg) => println!("  {} {}: {} ({})", tag, name, status.status, msg),
                None => println!("  {} {}: {}", tag, name, status.status),
            }
        }
    }
}

/// Sample lines keyed by series, e.g. `fio_outcomes_total{result="enriched"}`.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, f64> {
    metrics_text
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            Some((series.trim(), value.parse::<f64>().ok()?))
        })
        .collect()
}

fn print_metrics(values: &HashMap<&str, f64>) {
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    let count = |series: &str| values.get(series).map(|v| *v as u64).unwrap_or(0);

    println!(
        "Messages Consumed:   {}",
        format_number(count("fio_messages_consumed_total"))
    );
    println!(
        "Enriched:            {}",
        format_number(count(r#"fio_outcomes_total{result="enriched"}"#))
    );
    println!(
        "Enrichment Failed:   {}",
        format_number(count(r#"fio_outcomes_total{result="enrichment_failed"}"#))
    );
    println!(
        "Invalid Messages:    {}",
        format_number(count(r#"fio_outcomes_total{result="invalid_message"}"#))
    );
    println!("Read Errors:         {}", count("fio_read_errors_total"));
    println!("Delivery Failures:   {}", count("fio_delivery_failures_total"));
    println!("Dead Lettered:       {}", count("fio_dead_lettered_total"));
    println!("Commit Failures:     {}", count("fio_commit_failures_total"));
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
