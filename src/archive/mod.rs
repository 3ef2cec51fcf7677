//! Document archive integration: search, asynchronous export jobs, and content transfer.

mod client;
pub mod poller;
mod types;

pub use client::{GeodocClient, GeodocSettings};
pub use poller::{ExportError, ExportPoller, PollPolicy};
pub use types::{
    ArchiveError, ByteStream, DocumentKey, DocumentRef, ExportJob, ExportStatus,
    ExportStatusReport, ExportTicket,
};

use async_trait::async_trait;

/// Operations the enrichment pipeline needs from a document archive.
///
/// Authentication and session handling are the implementation's responsibility.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Find the documents filed under a case folder.
    async fn search(&self, key: &DocumentKey) -> Result<Vec<DocumentRef>, ArchiveError>;

    /// Start an export job for one document.
    ///
    /// Returns [`ArchiveError::NotFound`] when the archive does not know the document.
    async fn request_export(&self, document_id: &str) -> Result<ExportTicket, ArchiveError>;

    /// Query the status of a previously requested export job.
    async fn poll_export_status(
        &self,
        ticket: &ExportTicket,
    ) -> Result<ExportStatusReport, ArchiveError>;

    /// Open a byte stream for a ready export.
    async fn fetch_bytes(&self, uri: &str) -> Result<ByteStream, ArchiveError>;
}
