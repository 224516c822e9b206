//! FIO enricher CLI - streaming identity enrichment service.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fio_core::config::{LogFormat, LogLevel};
use fio_core::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (unreadable file, invalid TOML, failed validation)
    ConfigError = 1,
    /// Kafka client could not be created or subscribed
    KafkaError = 2,
    /// Lookup client could not be created or a lookup call failed
    LookupError = 3,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by its `fio_core::Error` kind.
    fn from_error(error: &anyhow::Error) -> Self {
        let core_error = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<fio_core::Error>());

        match core_error {
            Some(fio_core::Error::Config(_)) => ExitCode::ConfigError,
            Some(fio_core::Error::Kafka(_)) => ExitCode::KafkaError,
            Some(fio_core::Error::Lookup(_)) => ExitCode::LookupError,
            Some(_) | None => ExitCode::RuntimeError,
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "fio-enricher")]
#[command(about = "Enriches FIO identity records with age, gender and nationality", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (default: ./config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enrichment pipeline until SIGINT/SIGTERM
    Run {
        /// Override Kafka bootstrap servers (comma separated)
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override input topic
        #[arg(long)]
        input_topic: Option<String>,

        /// Override output topic
        #[arg(long)]
        output_topic: Option<String>,

        /// Override consumer group
        #[arg(long)]
        consumer_group: Option<String>,
    },

    /// Show health and metrics of a running instance
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL (default: health URL on port 9090)
        #[arg(long)]
        metrics_url: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

/// Overrides given on the `run` command line.
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub bootstrap_servers: Option<String>,
    pub input_topic: Option<String>,
    pub output_topic: Option<String>,
    pub consumer_group: Option<String>,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging follows the config when it loads; errors are reported after init
    let config = config_for(&cli.command, cli.config.as_deref());
    let (log_level, log_format) = match &config {
        Ok(Some(c)) => (c.monitoring.log_level, c.monitoring.log_format),
        _ => (LogLevel::Info, LogFormat::Json),
    };
    init_logging(cli.verbose, log_level, log_format);

    let result = match config {
        Ok(config) => execute_command(cli.command, config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

fn init_logging(verbose: u8, level: LogLevel, format: LogFormat) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new(level.as_str()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }
}

async fn execute_command(command: Commands, config: Option<Config>) -> Result<()> {
    match command {
        Commands::Run {
            bootstrap_servers,
            input_topic,
            output_topic,
            consumer_group,
        } => {
            let overrides = RunOverrides {
                bootstrap_servers,
                input_topic,
                output_topic,
                consumer_group,
            };
            commands::run::run(config.unwrap_or_default(), overrides).await?;
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, metrics_url.as_deref()).await?;
        }

        Commands::Validate => {
            let config = config.unwrap_or_default();
            config.validate()?;
            println!("Configuration is valid");
            println!("  input topic:  {}", config.kafka.input_topic);
            println!("  output topic: {}", config.kafka.output_topic);
            println!("  brokers:      {}", config.kafka.brokers());
            println!("  lookups:      {:?}", config.lookup.strategy);
        }
    }

    Ok(())
}

/// Load the config for commands that use it; `status` only talks to a running instance.
fn config_for(command: &Commands, path: Option<&Path>) -> Result<Option<Config>> {
    match command {
        Commands::Run { .. } | Commands::Validate => load_config(path).map(Some),
        Commands::Status { .. } => Ok(None),
    }
}

/// Load the config file, `./config.toml`, or built-in defaults, in that order.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let default_path = Path::new("config.toml");
    let path = match path {
        Some(path) => path,
        None if default_path.exists() => default_path,
        None => return Ok(Config::default()),
    };

    let config = Config::from_file(path).map_err(|e| match e {
        fio_core::Error::Io(io) => {
            fio_core::Error::Config(format!("Failed to read {}: {}", path.display(), io))
        }
        other => other,
    })?;
    Ok(config)
}
