//! Batch orchestration: search a case folder, export its documents, and stream summaries.
//!
//! Documents are exported concurrently and enriched concurrently; results are delivered in
//! completion order, each tagged with the file's position in the batch listing so callers can
//! restore the original order when they need it.

mod service;
mod types;

pub use service::{EnrichmentApi, EnrichmentPipeline, PipelineSettings};
pub use types::{BatchReport, DocumentError, PipelineError, PipelineResult};
