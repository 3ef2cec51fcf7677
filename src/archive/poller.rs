//! Export poller: request an export, poll until it is ready, and stream it to disk.
//!
//! Each document owns its own [`ExportJob`]; pollers share nothing but the destination
//! directory, which only ever gains new files. A file already present under the target name
//! short-circuits the whole protocol, so re-running a batch never re-exports a document.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::ArchiveClient;
use super::types::{ArchiveError, ExportJob, ExportStatus};

/// Extension used for published documents.
pub const DOCUMENT_EXTENSION: &str = "pdf";

/// Poll loop budget.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Maximum number of status queries.
    pub max_attempts: u32,
    /// Wait between two status queries.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Terminal failures of a single document export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The archive does not know the document.
    #[error("document {0} not found in archive")]
    NotFound(String),
    /// The export request itself failed.
    #[error("export request failed: {0}")]
    RequestFailed(#[source] ArchiveError),
    /// A status poll failed or reported a terminal status other than ready.
    #[error("export polling failed: {0}")]
    PollFailed(String),
    /// The export never became ready within the poll budget.
    #[error("export not ready after {attempts} polls")]
    Timeout {
        /// Number of status queries issued.
        attempts: u32,
    },
    /// Downloading the ready export failed.
    #[error("export transfer failed: {0}")]
    Transfer(#[source] ArchiveError),
    /// Writing the export to disk failed.
    #[error("failed to store export: {0}")]
    Io(#[from] std::io::Error),
    /// The batch was cancelled while the export was in flight.
    #[error("export cancelled")]
    Cancelled,
}

/// Drives the archive export protocol for individual documents.
#[derive(Clone)]
pub struct ExportPoller {
    archive: Arc<dyn ArchiveClient>,
    policy: PollPolicy,
}

impl ExportPoller {
    /// Build a poller over the given archive.
    pub fn new(archive: Arc<dyn ArchiveClient>, policy: PollPolicy) -> Self {
        Self { archive, policy }
    }

    /// Path a document is published under inside `destination`.
    pub fn document_path(destination: &Path, document_id: &str) -> PathBuf {
        destination.join(format!("{document_id}.{DOCUMENT_EXTENSION}"))
    }

    /// Make `document_id` available as a file in `destination` and return its path.
    pub async fn fetch_document(
        &self,
        document_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ExportError> {
        let target = Self::document_path(destination, document_id);
        if fs::try_exists(&target).await.unwrap_or(false) {
            tracing::info!(document_id, path = %target.display(), "Export already on disk; skipping");
            return Ok(target);
        }

        let mut job = ExportJob::new(document_id);
        tracing::debug!(document_id, "Requesting export");
        let ticket = match guarded(cancel, self.archive.request_export(document_id)).await? {
            Ok(ticket) => ticket,
            Err(ArchiveError::NotFound(_)) => {
                job.status = ExportStatus::NotFound;
                tracing::debug!(document_id, "Document not found; skipping");
                return Err(ExportError::NotFound(document_id.to_string()));
            }
            Err(error) => {
                tracing::warn!(document_id, error = %error, "Failed to initiate export");
                return Err(ExportError::RequestFailed(error));
            }
        };
        job.ticket = Some(ticket);

        let uri = self.poll_until_ready(&mut job, cancel).await?;
        tracing::info!(document_id, "Export ready; transferring");
        self.transfer(document_id, &uri, destination, &target, cancel)
            .await?;
        tracing::info!(document_id, path = %target.display(), "Export saved");
        Ok(target)
    }

    async fn poll_until_ready(
        &self,
        job: &mut ExportJob,
        cancel: &CancellationToken,
    ) -> Result<String, ExportError> {
        let Some(ticket) = job.ticket.clone() else {
            return Err(ExportError::PollFailed("export was never requested".into()));
        };
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            let report = match guarded(cancel, self.archive.poll_export_status(&ticket)).await? {
                Ok(report) => report,
                Err(ArchiveError::Malformed(reason)) => {
                    tracing::warn!(
                        document_id = %job.document_id,
                        attempt,
                        reason = %reason,
                        "Undecodable export status; polling again"
                    );
                    self.wait_between(attempt, cancel).await?;
                    continue;
                }
                Err(error) => {
                    job.status = ExportStatus::Failed;
                    tracing::error!(document_id = %job.document_id, attempt, error = %error, "Failed to poll export status");
                    return Err(ExportError::PollFailed(error.to_string()));
                }
            };

            job.status = report.status;
            match report.status {
                ExportStatus::Ready => {
                    return report.uri.ok_or_else(|| {
                        ExportError::PollFailed("export ready without a download URI".into())
                    });
                }
                status if status.is_in_progress() => {
                    tracing::debug!(
                        document_id = %job.document_id,
                        attempt,
                        max_attempts,
                        status = ?status,
                        "Export still in progress"
                    );
                    self.wait_between(attempt, cancel).await?;
                }
                status => {
                    tracing::warn!(document_id = %job.document_id, status = ?status, "Export cannot be downloaded");
                    return Err(ExportError::PollFailed(format!(
                        "archive reported status {status:?}"
                    )));
                }
            }
        }

        tracing::warn!(document_id = %job.document_id, attempts = max_attempts, "Export not ready in time");
        Err(ExportError::Timeout {
            attempts: max_attempts,
        })
    }

    async fn wait_between(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), ExportError> {
        if attempt < self.policy.max_attempts {
            guarded(cancel, tokio::time::sleep(self.policy.interval)).await?;
        }
        Ok(())
    }

    async fn transfer(
        &self,
        document_id: &str,
        uri: &str,
        destination: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ExportError> {
        let mut stream = guarded(cancel, self.archive.fetch_bytes(uri))
            .await?
            .map_err(|error| {
                tracing::warn!(document_id, error = %error, "Failed to download export");
                ExportError::Transfer(error)
            })?;

        fs::create_dir_all(destination).await?;
        let partial = destination.join(format!(
            "{document_id}.{}.part",
            uuid::Uuid::new_v4().simple()
        ));
        let written = async {
            let mut file = fs::File::create(&partial).await?;
            loop {
                let next = guarded(cancel, stream.next()).await?;
                match next {
                    Some(Ok(chunk)) => file.write_all(&chunk).await?,
                    Some(Err(error)) => return Err(ExportError::Transfer(error)),
                    None => break,
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), ExportError>(())
        }
        .await;

        let published = match written {
            Ok(()) => publish(&partial, target).await,
            Err(error) => Err(error),
        };
        let _ = fs::remove_file(&partial).await;
        published
    }
}

/// Link the finished partial file under its final name without replacing an existing file.
async fn publish(partial: &Path, target: &Path) -> Result<(), ExportError> {
    let linked = fs::hard_link(partial, target).await;
    settle_publish(partial, target, linked).await
}

/// Resolve the outcome of the hard link, renaming into place where links are unsupported.
async fn settle_publish(
    partial: &Path,
    target: &Path,
    linked: std::io::Result<()>,
) -> Result<(), ExportError> {
    match linked {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %target.display(), "Export published concurrently; keeping existing file");
            Ok(())
        }
        Err(error) => {
            tracing::debug!(path = %target.display(), error = %error, "Hard link unavailable; renaming export into place");
            if fs::try_exists(target).await.unwrap_or(false) {
                return Ok(());
            }
            fs::rename(partial, target).await?;
            Ok(())
        }
    }
}

/// Race `future` against cancellation of the batch.
async fn guarded<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output, ExportError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExportError::Cancelled),
        output = future => Ok(output),
    }
}
