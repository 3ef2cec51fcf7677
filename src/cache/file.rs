//! JSON file store with lock-file based writer exclusion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::fs;
use tokio::time::sleep;

use super::{CacheKey, CacheWriteError, ResultCache};

/// Writer lock tuning.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Retries after the first failed lock acquisition.
    pub lock_retries: usize,
    /// First backoff delay.
    pub min_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Age after which a lock file is considered abandoned by a crashed writer.
    pub stale_after: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            lock_retries: 8,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Cache persisted as a single human-readable JSON object.
#[derive(Debug, Clone)]
pub struct JsonFileCache {
    path: PathBuf,
    lock_path: PathBuf,
    policy: CachePolicy,
}

#[derive(Debug)]
enum LockError {
    Busy,
    Io(std::io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => f.write_str("lock held by another writer"),
            Self::Io(error) => write!(f, "{error}"),
        }
    }
}

/// Held while a writer owns the store; removes the lock file when released.
struct WriteLock {
    path: PathBuf,
    released: bool,
}

impl WriteLock {
    async fn release(mut self) {
        self.released = true;
        if let Err(error) = fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %error, "Failed to remove cache lock");
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl JsonFileCache {
    /// Open (lazily) the store at `path`.
    pub fn new(path: impl Into<PathBuf>, policy: CachePolicy) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, ".lock");
        Self {
            path,
            lock_path,
            policy,
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, std::io::Error> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(error),
        }
    }

    async fn acquire_once(&self) -> Result<WriteLock, LockError> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(_) => Ok(WriteLock {
                path: self.lock_path.clone(),
                released: false,
            }),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.is_stale(&self.lock_path).await {
                    self.reclaim_stale_lock().await;
                }
                Err(LockError::Busy)
            }
            Err(error) => Err(LockError::Io(error)),
        }
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(path).await else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.policy.stale_after)
    }

    /// Move the lock aside under a unique name before deleting it, so only one contender
    /// reclaims it. A lock that turns out to be fresh once moved is put back.
    async fn reclaim_stale_lock(&self) {
        let aside = sibling(&self.lock_path, &format!(".{}.stale", uuid::Uuid::new_v4().simple()));
        if fs::rename(&self.lock_path, &aside).await.is_err() {
            // Another contender got there first.
            return;
        }
        if self.is_stale(&aside).await {
            tracing::warn!(path = %self.lock_path.display(), "Removed stale cache lock");
        } else if fs::hard_link(&aside, &self.lock_path).await.is_err() {
            tracing::warn!(path = %self.lock_path.display(), "Live cache lock replaced while reclaiming");
        }
        let _ = fs::remove_file(&aside).await;
    }

    async fn acquire(&self) -> Result<WriteLock, CacheWriteError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.policy.min_delay)
            .with_max_delay(self.policy.max_delay)
            .with_max_times(self.policy.lock_retries)
            .with_jitter();

        (|| self.acquire_once())
            .retry(backoff)
            .sleep(sleep)
            .when(|error| matches!(error, LockError::Busy))
            .notify(|error: &LockError, delay: Duration| {
                tracing::debug!(
                    path = %self.lock_path.display(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Cache store busy; retrying"
                );
            })
            .await
            .map_err(|error| match error {
                LockError::Busy => CacheWriteError::LockContended {
                    attempts: self.policy.lock_retries + 1,
                },
                LockError::Io(error) => CacheWriteError::Io(error),
            })
    }

    async fn merge_and_write(&self, key: String, value: &str) -> Result<(), CacheWriteError> {
        let mut entries = match self.read_all().await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::InvalidData => {
                let preserved = sibling(
                    &self.path,
                    &format!(".corrupt-{}", uuid::Uuid::new_v4().simple()),
                );
                fs::rename(&self.path, &preserved).await?;
                tracing::warn!(
                    path = %self.path.display(),
                    preserved = %preserved.display(),
                    error = %error,
                    "Cache store unreadable; moved aside and starting fresh"
                );
                BTreeMap::new()
            }
            Err(error) => return Err(CacheWriteError::Io(error)),
        };
        entries.insert(key, value.to_string());

        let serialized = serde_json::to_vec_pretty(&entries)?;
        let temp_path = sibling(&self.path, &format!(".{}.tmp", uuid::Uuid::new_v4().simple()));

        if let Err(error) = fs::write(&temp_path, &serialized).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }
        if let Err(error) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }
        Ok(())
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[async_trait]
impl ResultCache for JsonFileCache {
    async fn try_get(&self, key: &CacheKey) -> Option<String> {
        match self.read_all().await {
            Ok(mut entries) => entries.remove(&key.to_string()),
            Err(error) => {
                tracing::warn!(path = %self.path.display(), error = %error, "Cache read failed; treating as miss");
                None
            }
        }
    }

    async fn put(&self, key: &CacheKey, value: &str) -> Result<(), CacheWriteError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let lock = self.acquire().await?;
        let result = self.merge_and_write(key.to_string(), value).await;
        lock.release().await;

        if result.is_ok() {
            tracing::debug!(key = %key, "Cache entry stored");
        }
        result
    }
}
