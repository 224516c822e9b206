//! Record enrichment and the pipeline that drives it.

mod enricher;
mod pipeline;

pub use enricher::{Enricher, Enrichment, LookupFailure};
pub use pipeline::EnrichmentPipeline;
