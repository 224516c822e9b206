//! FIO Core - streaming identity enrichment
//!
//! Consumes `{name, surname, patronymic}` records from Kafka, resolves age,
//! gender and nationality from three HTTP lookup services, and publishes one
//! enriched or failed outcome per record:
//!
//! - Lookups with per-call timeouts, retry and a circuit breaker per service
//! - Tagged join of the three lookups, so failed records never carry partial data
//! - One long-lived producer with retried delivery and a dead-letter topic
//! - Offsets committed only after delivery (at-least-once)

pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod kafka;
pub mod lookup;
pub mod metrics;
pub mod model;
pub mod retry;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, KafkaError, LookupError, Result};
