//! Text recognition collaborator and its HTTP adapter.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors raised by recognition providers.
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// The recognition service could not be reached.
    #[error("Recognition service unavailable: {0}")]
    Unavailable(String),
    /// The recognition service rejected the request.
    #[error("Recognition failed: {0}")]
    Failed(String),
    /// The response could not be decoded.
    #[error("Malformed recognition response: {0}")]
    InvalidResponse(String),
}

/// Interface implemented by text recognition backends.
///
/// Implementations must tolerate being dropped mid-call; cancellation is expressed by
/// dropping the returned future.
#[async_trait]
pub trait RecognitionClient: Send + Sync {
    /// Extract the text of the document stored at `file_path`.
    async fn recognize(&self, file_path: &Path) -> Result<String, RecognitionError>;
}

/// Recognition client posting file references to an OCR service sharing the download volume.
pub struct HttpRecognitionClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    text: String,
}

impl HttpRecognitionClient {
    /// Build a client for the OCR service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RecognitionError> {
        let http = Client::builder()
            .user_agent("arkivgist/ocr")
            .build()
            .map_err(|error| RecognitionError::Unavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/ocr", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RecognitionClient for HttpRecognitionClient {
    async fn recognize(&self, file_path: &Path) -> Result<String, RecognitionError> {
        tracing::debug!(path = %file_path.display(), "Requesting text recognition");
        let response = self
            .http
            .post(self.endpoint())
            .json(&json!({ "filename": file_path.to_string_lossy() }))
            .send()
            .await
            .map_err(|error| {
                RecognitionError::Unavailable(format!(
                    "failed to reach OCR service at {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecognitionError::Failed(format!(
                "OCR service returned {status}: {body}"
            )));
        }

        let body: RecognitionResponse = response.json().await.map_err(|error| {
            RecognitionError::InvalidResponse(format!("failed to decode OCR response: {error}"))
        })?;
        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn posts_filename_and_reads_text() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/ocr")
                    .json_body(json!({ "filename": "/data/12-3-0/77.pdf" }));
                then.status(200)
                    .json_body(json!({ "text": "Vedtak om dispensasjon" }));
            })
            .await;

        let client = HttpRecognitionClient::new(server.base_url()).expect("client");
        let text = client
            .recognize(Path::new("/data/12-3-0/77.pdf"))
            .await
            .expect("text");

        mock.assert_async().await;
        assert_eq!(text, "Vedtak om dispensasjon");
    }

    #[tokio::test]
    async fn error_status_is_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/ocr");
                then.status(500).body("engine crashed");
            })
            .await;

        let client = HttpRecognitionClient::new(server.base_url()).expect("client");
        let error = client
            .recognize(Path::new("/tmp/doc.pdf"))
            .await
            .expect_err("failure");
        assert!(matches!(error, RecognitionError::Failed(message) if message.contains("500")));
    }
}
