//! Metrics collection and export.

mod prometheus;

pub use self::prometheus::{PipelineMetrics, RESULT_ENRICHED};
