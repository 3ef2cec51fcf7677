//! Enrichment service coordinating export, recognition, caching, and summarization.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::archive::poller::DOCUMENT_EXTENSION;
use crate::archive::{
    ArchiveClient, DocumentKey, DocumentRef, ExportError, ExportPoller, GeodocClient,
    GeodocSettings, PollPolicy,
};
use crate::cache::{CacheKey, CachePolicy, JsonFileCache, ResultCache};
use crate::config::Config;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::recognition::{
    CircuitBreaker, CircuitState, HttpRecognitionClient, RecognitionCallError, ResilientRecognizer,
};
use crate::summarization::{SummarizationClient, summarization_client_from_config};

use super::types::{BatchReport, DocumentError, DocumentOutcome, PipelineError, PipelineResult};

/// Tunables that do not belong to any single collaborator.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Root under which each batch gets its own download directory.
    pub download_root: PathBuf,
    /// Whether cached summaries are served. Writes happen regardless.
    pub cache_reads_enabled: bool,
    /// Export poll budget.
    pub poll_policy: PollPolicy,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            download_root: config.download_dir.clone(),
            cache_reads_enabled: config.cache_reads_enabled,
            poll_policy: config.poll_policy(),
        }
    }
}

/// Abstraction over the enrichment pipeline used by external surfaces (HTTP, CLI).
#[async_trait]
pub trait EnrichmentApi: Send + Sync {
    /// Run one batch, streaming results into `sink` until every document is settled.
    async fn process(
        &self,
        key: DocumentKey,
        sink: mpsc::Sender<PipelineResult>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, PipelineError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;

    /// Current state of the recognition circuit.
    fn circuit_state(&self) -> CircuitState;
}

/// Coordinates a batch end to end: archive search, concurrent exports, and per-file enrichment.
///
/// The service owns long-lived handles to every collaborator, including the recognition circuit
/// breaker, so all batches served by one process share a single resilience policy. Construct it
/// once near process start and share it through an `Arc`.
pub struct EnrichmentPipeline {
    archive: Arc<dyn ArchiveClient>,
    poller: ExportPoller,
    recognizer: ResilientRecognizer,
    summarizer: Arc<dyn SummarizationClient>,
    cache: Arc<dyn ResultCache>,
    settings: PipelineSettings,
    metrics: Arc<PipelineMetrics>,
}

impl EnrichmentPipeline {
    /// Assemble a pipeline from explicit collaborators.
    pub fn new(
        archive: Arc<dyn ArchiveClient>,
        recognizer: ResilientRecognizer,
        summarizer: Arc<dyn SummarizationClient>,
        cache: Arc<dyn ResultCache>,
        settings: PipelineSettings,
    ) -> Self {
        let poller = ExportPoller::new(archive.clone(), settings.poll_policy);
        Self {
            archive,
            poller,
            recognizer,
            summarizer,
            cache,
            settings,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Build the production pipeline: Geodoc archive, HTTP OCR, configured summarizer, JSON cache.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let archive = GeodocClient::new(GeodocSettings::from(config))
            .map_err(|error| PipelineError::Init(format!("archive client: {error}")))?;
        let ocr = HttpRecognitionClient::new(config.ocr_url.clone())
            .map_err(|error| PipelineError::Init(format!("recognition client: {error}")))?;
        let summarizer = summarization_client_from_config(config)
            .map_err(|error| PipelineError::Init(format!("summarization client: {error}")))?;
        let recognizer = ResilientRecognizer::new(
            Arc::new(ocr),
            Arc::new(CircuitBreaker::new(config.breaker_policy())),
            config.ocr_timeout(),
        );
        let cache = JsonFileCache::new(config.cache_path.clone(), CachePolicy::default());
        tracing::info!(
            cache = %cache.path().display(),
            downloads = %config.download_dir.display(),
            "Enrichment pipeline initialized"
        );

        Ok(Self::new(
            Arc::new(archive),
            recognizer,
            Arc::from(summarizer),
            Arc::new(cache),
            PipelineSettings::from(config),
        ))
    }

    /// Counters accumulated across batches, including circuit openings.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            circuit_openings: self.recognizer.breaker().opened_count(),
            ..self.metrics.snapshot()
        }
    }

    /// Run one batch for `key`.
    ///
    /// Results reach `sink` in completion order. Cancelling `cancel`, or dropping the receiving
    /// half of `sink`, abandons the documents still in flight; results already delivered stay
    /// delivered. Per-document failures are logged and counted in the returned report.
    pub async fn process(
        &self,
        key: DocumentKey,
        sink: mpsc::Sender<PipelineResult>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        let started = Instant::now();
        let batch = cancel.child_token();
        tracing::info!(batch = %key, "Processing batch");

        let documents = tokio::select! {
            biased;
            _ = batch.cancelled() => {
                tracing::info!(batch = %key, "Batch cancelled before search completed");
                return Ok(BatchReport::default());
            }
            result = self.archive.search(&key) => result.map_err(PipelineError::Search)?,
        };
        self.metrics.record_batch(documents.len() as u64);
        let mut report = BatchReport {
            found: documents.len(),
            ..BatchReport::default()
        };
        if documents.is_empty() {
            tracing::info!(batch = %key, "No documents found");
            return Ok(report);
        }

        let directory = self.settings.download_root.join(key.directory_name());
        fs::create_dir_all(&directory)
            .await
            .map_err(|source| PipelineError::Setup {
                path: directory.clone(),
                source,
            })?;

        self.export_all(&documents, &directory, &batch, &mut report)
            .await;

        let ids: HashSet<&str> = documents.iter().map(|doc| doc.id.as_str()).collect();
        let files = list_documents(&directory, &ids)
            .await
            .map_err(|source| PipelineError::Setup {
                path: directory.clone(),
                source,
            })?;
        tracing::debug!(batch = %key, files = files.len(), "Enriching downloaded files");

        self.enrich_all(key, files, &sink, &batch, &mut report).await;

        tracing::info!(
            batch = %key,
            found = report.found,
            downloaded = report.downloaded,
            emitted = report.emitted,
            cache_hits = report.cache_hits,
            failed = report.failed,
            abandoned = report.abandoned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        Ok(report)
    }

    async fn export_all(
        &self,
        documents: &[DocumentRef],
        directory: &Path,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) {
        let mut exports = JoinSet::new();
        for document in documents {
            let poller = self.poller.clone();
            let directory = directory.to_path_buf();
            let cancel = cancel.clone();
            let id = document.id.clone();
            exports.spawn(async move {
                let result = poller.fetch_document(&id, &directory, &cancel).await;
                (id, result)
            });
        }

        while let Some(joined) = exports.join_next().await {
            let (id, error) = match joined {
                Ok((_, Ok(_))) => {
                    report.downloaded += 1;
                    self.metrics.record_download();
                    continue;
                }
                Ok((id, Err(ExportError::Cancelled))) => {
                    tracing::debug!(document_id = %id, "Export abandoned");
                    report.abandoned += 1;
                    self.metrics.record_abandoned();
                    continue;
                }
                Ok((id, Err(error))) => (id, DocumentError::from(error)),
                Err(error) => (String::from("<unknown>"), DocumentError::Aborted(error.to_string())),
            };
            tracing::warn!(document_id = %id, error = %error, "Export failed; skipping document");
            report.failed += 1;
            self.metrics.record_failure();
        }
    }

    async fn enrich_all(
        &self,
        key: DocumentKey,
        files: Vec<(String, PathBuf)>,
        sink: &mpsc::Sender<PipelineResult>,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) {
        let mut tasks = JoinSet::new();
        for (index, (document, path)) in files.into_iter().enumerate() {
            let task = DocumentTask {
                cache_key: CacheKey::new(key, index),
                document,
                path,
                recognizer: self.recognizer.clone(),
                summarizer: self.summarizer.clone(),
                cache: self.cache.clone(),
                metrics: self.metrics.clone(),
                cache_reads_enabled: self.settings.cache_reads_enabled,
                sink: sink.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(task.run());
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|error| {
                DocumentOutcome::Failed(DocumentError::Aborted(error.to_string()))
            });
            match outcome {
                DocumentOutcome::Emitted { cached } => {
                    report.emitted += 1;
                    if cached {
                        report.cache_hits += 1;
                    }
                }
                DocumentOutcome::Abandoned => {
                    report.abandoned += 1;
                    self.metrics.record_abandoned();
                }
                DocumentOutcome::Failed(error) => {
                    tracing::debug!(error = %error, "Document skipped");
                    report.failed += 1;
                    self.metrics.record_failure();
                }
            }
        }
    }
}

#[async_trait]
impl EnrichmentApi for EnrichmentPipeline {
    async fn process(
        &self,
        key: DocumentKey,
        sink: mpsc::Sender<PipelineResult>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        EnrichmentPipeline::process(self, key, sink, cancel).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        EnrichmentPipeline::metrics_snapshot(self)
    }

    fn circuit_state(&self) -> CircuitState {
        self.recognizer.circuit_state()
    }
}

/// Everything one file needs to travel from disk to the sink.
struct DocumentTask {
    cache_key: CacheKey,
    document: String,
    path: PathBuf,
    recognizer: ResilientRecognizer,
    summarizer: Arc<dyn SummarizationClient>,
    cache: Arc<dyn ResultCache>,
    metrics: Arc<PipelineMetrics>,
    cache_reads_enabled: bool,
    sink: mpsc::Sender<PipelineResult>,
    cancel: CancellationToken,
}

impl DocumentTask {
    async fn run(self) -> DocumentOutcome {
        if self.cancel.is_cancelled() {
            return DocumentOutcome::Abandoned;
        }

        let cached = if self.cache_reads_enabled {
            self.cache.try_get(&self.cache_key).await
        } else {
            None
        };

        let (summary, from_cache) = match cached {
            Some(summary) => {
                tracing::debug!(
                    document_id = %self.document,
                    file_index = self.cache_key.file_index,
                    "Cache hit"
                );
                self.metrics.record_cache_hit();
                (summary, true)
            }
            None => match self.compute().await {
                Ok(Some(summary)) => (summary, false),
                Ok(None) => return DocumentOutcome::Abandoned,
                Err(error) => {
                    tracing::warn!(
                        document_id = %self.document,
                        file_index = self.cache_key.file_index,
                        error = %error,
                        "Enrichment failed"
                    );
                    return DocumentOutcome::Failed(error);
                }
            },
        };

        if self.cancel.is_cancelled() {
            return DocumentOutcome::Abandoned;
        }

        if !from_cache {
            if let Err(error) = self.cache.put(&self.cache_key, &summary).await {
                tracing::warn!(
                    document_id = %self.document,
                    key = %self.cache_key,
                    error = %error,
                    "Failed to cache summary"
                );
                self.metrics.record_cache_write_failure();
            }
        }

        let result = PipelineResult {
            sequence_id: self.cache_key.file_index,
            summary,
            document: self.document,
        };
        let delivered = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sink.send(result) => sent.is_ok(),
        };
        if !delivered {
            // Nobody is listening anymore; stop the rest of the batch.
            self.cancel.cancel();
            return DocumentOutcome::Abandoned;
        }
        self.metrics.record_emitted();
        DocumentOutcome::Emitted { cached: from_cache }
    }

    /// Recognize and summarize; `Ok(None)` means the batch was cancelled midway.
    async fn compute(&self) -> Result<Option<String>, DocumentError> {
        let text = match self.recognizer.call(&self.path, &self.cancel).await {
            Ok(text) => text,
            Err(RecognitionCallError::Cancelled) => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        if text.trim().is_empty() {
            return Err(DocumentError::EmptyText);
        }
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            summary = self.summarizer.summarize(&text) => Ok(Some(summary?)),
        }
    }
}

/// Published files of this batch's documents, sorted by name.
async fn list_documents(
    directory: &Path,
    ids: &HashSet<&str>,
) -> Result<Vec<(String, PathBuf)>, std::io::Error> {
    let mut entries = fs::read_dir(directory).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(DOCUMENT_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if ids.contains(stem) {
            files.push((stem.to_string(), path));
        }
    }
    files.sort_by(|a, b| a.1.file_name().cmp(&b.1.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_is_sorted_and_limited_to_batch_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.pdf", "a.pdf", "c.pdf", "stray.pdf", "a.1234.part", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"%PDF").expect("seed");
        }
        let ids: HashSet<&str> = ["a", "b", "c", "notes"].into_iter().collect();

        let files = list_documents(dir.path(), &ids).await.expect("listing");
        let names: Vec<&str> = files.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(files[0].1, dir.path().join("a.pdf"));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ids = HashSet::new();
        assert!(list_documents(&dir.path().join("absent"), &ids).await.is_err());
    }
}
