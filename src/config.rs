use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::archive::poller::PollPolicy;
use crate::recognition::breaker::BreakerPolicy;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ArkivGist server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the document archive API (e.g. `https://api.geodoc.no`).
    pub archive_base_url: String,
    /// Archive tenant that owns the records.
    pub archive_tenant: String,
    /// Series the case records are filed under.
    pub archive_series_id: String,
    /// Document category a search hit must carry to be enriched.
    pub archive_category: String,
    /// OAuth2 token endpoint used for the client-credentials exchange.
    pub archive_token_url: String,
    /// OAuth2 client identifier.
    pub archive_client_id: String,
    /// OAuth2 client secret.
    pub archive_client_secret: String,
    /// OAuth2 scope requested for archive access.
    pub archive_scope: String,
    /// Base URL of the text recognition service.
    pub ocr_url: String,
    /// Per-call budget for a recognition request.
    pub ocr_timeout_secs: u64,
    /// Summarization backend.
    pub summarization_provider: SummarizationProvider,
    /// Optional Ollama base URL override.
    pub ollama_url: Option<String>,
    /// Model passed to the summarization backend.
    pub summarization_model: String,
    /// Word budget for a single summary.
    pub summarization_max_words: usize,
    /// Root directory that receives exported documents.
    pub download_dir: PathBuf,
    /// Location of the persisted summary cache.
    pub cache_path: PathBuf,
    /// Whether cached summaries may be reused. Writes happen regardless.
    pub cache_reads_enabled: bool,
    /// Maximum number of export status polls per document.
    pub export_poll_attempts: u32,
    /// Delay between two export status polls.
    pub export_poll_interval_ms: u64,
    /// Rolling window sampled by the circuit breaker.
    pub breaker_window_secs: u64,
    /// Calls required in the window before the breaker may open.
    pub breaker_min_throughput: usize,
    /// Failure ratio that opens the breaker.
    pub breaker_failure_ratio: f64,
    /// How long the breaker stays open.
    pub breaker_break_secs: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported summarization backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SummarizationProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Returns the recognized text unchanged; useful for offline runs.
    Echo,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            optional(&lookup, key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
        };

        Ok(Self {
            archive_base_url: required("ARCHIVE_BASE_URL")?,
            archive_tenant: required("ARCHIVE_TENANT")?,
            archive_series_id: optional(&lookup, "ARCHIVE_SERIES_ID")
                .unwrap_or_else(|| "1099".into()),
            archive_category: optional(&lookup, "ARCHIVE_CATEGORY")
                .unwrap_or_else(|| "Vedtak".into()),
            archive_token_url: required("ARCHIVE_TOKEN_URL")?,
            archive_client_id: required("ARCHIVE_CLIENT_ID")?,
            archive_client_secret: required("ARCHIVE_CLIENT_SECRET")?,
            archive_scope: required("ARCHIVE_SCOPE")?,
            ocr_url: required("OCR_URL")?,
            ocr_timeout_secs: parse_or(&lookup, "OCR_TIMEOUT_SECS", 120)?,
            summarization_provider: optional(&lookup, "SUMMARIZATION_PROVIDER")
                .map(|value| {
                    value.parse::<SummarizationProvider>().map_err(|()| {
                        ConfigError::InvalidValue("SUMMARIZATION_PROVIDER".to_string())
                    })
                })
                .transpose()?
                .unwrap_or(SummarizationProvider::Ollama),
            ollama_url: optional(&lookup, "OLLAMA_URL"),
            summarization_model: optional(&lookup, "SUMMARIZATION_MODEL")
                .unwrap_or_else(|| "llama3.1".into()),
            summarization_max_words: parse_or(&lookup, "SUMMARIZATION_MAX_WORDS", 15)?,
            download_dir: optional(&lookup, "DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("DocumentPDF")),
            cache_path: optional(&lookup, "CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cache/summaries.json")),
            cache_reads_enabled: parse_or(&lookup, "CACHE_READS_ENABLED", true)?,
            export_poll_attempts: parse_or(&lookup, "EXPORT_POLL_ATTEMPTS", 10)?,
            export_poll_interval_ms: parse_or(&lookup, "EXPORT_POLL_INTERVAL_MS", 1000)?,
            breaker_window_secs: parse_or(&lookup, "BREAKER_WINDOW_SECS", 120)?,
            breaker_min_throughput: parse_or(&lookup, "BREAKER_MIN_THROUGHPUT", 7)?,
            breaker_failure_ratio: parse_ratio(&lookup, "BREAKER_FAILURE_RATIO", 0.5)?,
            breaker_break_secs: parse_or(&lookup, "BREAKER_BREAK_SECS", 120)?,
            server_port: optional(&lookup, "SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Poll loop settings for the export poller.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.export_poll_attempts,
            interval: Duration::from_millis(self.export_poll_interval_ms),
        }
    }

    /// Circuit breaker settings for recognition calls.
    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            sampling_window: Duration::from_secs(self.breaker_window_secs),
            min_throughput: self.breaker_min_throughput,
            failure_ratio: self.breaker_failure_ratio,
            break_duration: Duration::from_secs(self.breaker_break_secs),
        }
    }

    /// Per-call recognition budget.
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match optional(lookup, key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

/// Parse a fraction in `(0, 1]`.
fn parse_ratio<F>(lookup: &F, key: &str, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ratio: f64 = parse_or(lookup, key, default)?;
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(ratio)
    } else {
        Err(ConfigError::InvalidValue(key.to_string()))
    }
}

impl std::str::FromStr for SummarizationProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "echo" => Ok(Self::Echo),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        archive = %config.archive_base_url,
        tenant = %config.archive_tenant,
        ocr = %config.ocr_url,
        provider = ?config.summarization_provider,
        cache = %config.cache_path.display(),
        cache_reads = config.cache_reads_enabled,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
