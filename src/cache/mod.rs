//! Idempotency cache for computed summaries.
//!
//! The pipeline consults the cache before running recognition and summarization so a repeated
//! request for the same case folder skips work that already succeeded.

mod file;

pub use file::{CachePolicy, JsonFileCache};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::archive::DocumentKey;

/// Identity of a cached result: the case folder plus the file's position in its listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Case folder the file belongs to.
    pub batch: DocumentKey,
    /// Position of the file in the batch's sorted file listing.
    pub file_index: usize,
}

impl CacheKey {
    /// Build a key for `file_index` within `batch`.
    pub const fn new(batch: DocumentKey, file_index: usize) -> Self {
        Self { batch, file_index }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.batch, self.file_index)
    }
}

/// Errors raised while persisting a cache entry. Never fatal for the pipeline.
#[derive(Debug, Error)]
pub enum CacheWriteError {
    /// Another writer held the store for the whole retry budget.
    #[error("cache store is locked by another writer (gave up after {attempts} attempts)")]
    LockContended {
        /// Acquisition attempts made.
        attempts: usize,
    },
    /// Reading or writing the store failed.
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The merged mapping could not be serialized.
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key-value store holding summaries of already processed files.
///
/// Reads never fail and take no lock; writers get exclusive access for a read-merge-write
/// cycle.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Look up a cached value. Missing or unreadable stores are cache misses.
    async fn try_get(&self, key: &CacheKey) -> Option<String>;

    /// Persist `value` under `key`, merging with concurrently written entries.
    async fn put(&self, key: &CacheKey, value: &str) -> Result<(), CacheWriteError>;
}
