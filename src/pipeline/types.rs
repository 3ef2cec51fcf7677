//! Result records and error definitions for the enrichment pipeline.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::archive::{ArchiveError, ExportError};
use crate::recognition::RecognitionCallError;
use crate::summarization::SummarizationClientError;

/// One summary delivered to the caller of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    /// Position of the source file in the batch's sorted file listing.
    pub sequence_id: usize,
    /// Generated (or cached) summary text.
    pub summary: String,
    /// Archive identifier of the source document.
    pub document: String,
}

/// Per-batch accounting returned once every document has reached a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Documents returned by the archive search.
    pub found: usize,
    /// Documents available on disk after the export step.
    pub downloaded: usize,
    /// Results delivered to the sink.
    pub emitted: usize,
    /// Results served from the cache.
    pub cache_hits: usize,
    /// Documents skipped because of an error.
    pub failed: usize,
    /// Documents abandoned because the batch was cancelled.
    pub abandoned: usize,
}

/// Errors that abort a whole batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The archive search failed; nothing was processed.
    #[error("archive search failed: {0}")]
    Search(#[source] ArchiveError),
    /// The batch working directory could not be prepared or listed.
    #[error("failed to prepare batch directory {path}: {source}")]
    Setup {
        /// Directory the pipeline tried to use.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// A collaborator could not be constructed from configuration.
    #[error("failed to initialize pipeline: {0}")]
    Init(String),
}

/// Reasons a single document produced no result. Logged and counted, never propagated.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The export protocol failed.
    #[error(transparent)]
    Export(#[from] ExportError),
    /// Recognition failed, timed out, or was refused by the open circuit.
    #[error(transparent)]
    Recognition(#[from] RecognitionCallError),
    /// Recognition succeeded but returned no text.
    #[error("recognition returned no text")]
    EmptyText,
    /// The summarizer failed.
    #[error(transparent)]
    Summarization(#[from] SummarizationClientError),
    /// The worker task panicked.
    #[error("document task aborted: {0}")]
    Aborted(String),
}

/// Terminal state of one document within a batch.
#[derive(Debug)]
pub(crate) enum DocumentOutcome {
    Emitted { cached: bool },
    Abandoned,
    Failed(DocumentError),
}
