//! Shared types used by the archive client and the export poller.

use bytes::Bytes;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned while interacting with the archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive does not know the requested document.
    #[error("Document {0} not found in archive")]
    NotFound(String),
    /// Base URL failed to parse or normalize.
    #[error("Invalid archive URL: {0}")]
    InvalidUrl(String),
    /// Token exchange did not produce a usable bearer token.
    #[error("Archive authentication failed: {0}")]
    Authentication(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The archive responded with an unexpected status code.
    #[error("Unexpected archive response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the archive.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// The archive responded successfully but the body could not be decoded.
    #[error("Malformed archive response: {0}")]
    Malformed(String),
}

/// Byte stream of an exported document.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ArchiveError>> + Send>>;

/// Composite identifier of a case folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Top-level grouping (cadastral unit number).
    pub group: u32,
    /// Second-level grouping (property unit number).
    pub subgroup: u32,
    /// Section within the subgroup.
    pub section: u32,
}

impl DocumentKey {
    /// Build a key from its three components.
    pub const fn new(group: u32, subgroup: u32, section: u32) -> Self {
        Self {
            group,
            subgroup,
            section,
        }
    }

    /// Directory name used for this batch's downloads.
    pub fn directory_name(&self) -> String {
        format!("{}-{}-{}", self.group, self.subgroup, self.section)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.subgroup, self.section)
    }
}

/// A document discovered by [`super::ArchiveClient::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Archive-assigned identifier.
    pub id: String,
    /// Category tag that qualified the document.
    pub category: String,
}

/// Handle to an archive-side export job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExportTicket {
    /// Storage container holding the export.
    #[serde(rename = "containerName")]
    pub container: String,
    /// Blob name of the export inside the container.
    #[serde(rename = "blobName")]
    pub blob: String,
}

/// Lifecycle of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    /// Export has been requested but not yet polled.
    Requested,
    /// Archive has queued the export.
    Pending,
    /// Archive is preparing the export.
    Accepted,
    /// Export can be downloaded.
    Ready,
    /// Archive gave up on the export.
    Failed,
    /// Archive does not know the document.
    NotFound,
}

impl ExportStatus {
    /// Map the archive's wire status onto the export lifecycle.
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "accepted" => Self::Accepted,
            "success" | "ready" => Self::Ready,
            "notfound" | "not_found" => Self::NotFound,
            _ => Self::Failed,
        }
    }

    /// Whether the poll loop should keep waiting.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Requested | Self::Pending | Self::Accepted)
    }
}

/// Result of a single export status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportStatusReport {
    /// Current job status.
    pub status: ExportStatus,
    /// Retrieval URI, present once the export is ready.
    pub uri: Option<String>,
}

/// Transient state of one in-flight export, owned by a single poll loop.
#[derive(Debug, Clone)]
pub struct ExportJob {
    /// Document being exported.
    pub document_id: String,
    /// Archive handle for the job, known once the export was requested.
    pub ticket: Option<ExportTicket>,
    /// Last observed status.
    pub status: ExportStatus,
}

impl ExportJob {
    pub(crate) fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            ticket: None,
            status: ExportStatus::Requested,
        }
    }
}
