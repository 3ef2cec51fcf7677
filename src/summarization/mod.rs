//! Abstractions for generating short document summaries via language models.
//!
//! The Ollama-backed client issues HTTP requests directly to the runtime. The echo client
//! returns the recognized text unchanged, which keeps the pipeline usable without a model.

use crate::config::{Config, SummarizationProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Errors surfaced while attempting summarization.
#[derive(Debug, Error)]
pub enum SummarizationClientError {
    /// Provider was unreachable or could not be constructed.
    #[error("Summarization provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Failed to generate summary: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
    /// There was no text to summarize.
    #[error("No text to summarize")]
    EmptyInput,
}

/// Interface implemented by summarization providers.
#[async_trait]
pub trait SummarizationClient: Send + Sync {
    /// Produce a short summary of `text`.
    async fn summarize(&self, text: &str) -> Result<String, SummarizationClientError>;
}

/// Build a summarization client based on configuration.
pub fn summarization_client_from_config(
    config: &Config,
) -> Result<Box<dyn SummarizationClient>, SummarizationClientError> {
    match config.summarization_provider {
        SummarizationProvider::Echo => Ok(Box::new(EchoSummarizationClient)),
        SummarizationProvider::Ollama => {
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            Ok(Box::new(OllamaSummarizationClient::new(
                base_url,
                config.summarization_model.clone(),
                config.summarization_max_words,
            )?))
        }
    }
}

/// Build the instruction sent ahead of the document text.
pub(crate) fn build_prompt(text: &str, max_words: usize) -> String {
    format!(
        "System: You are an assistant that summarizes archived case decisions. Summarize the \
         document according to its title or its most important information. The most important \
         fact is whether the application was approved. Do not include the location. Answer in \
         Norwegian in fewer than {max_words} words and always start with the year, in the form \
         'YYYY: Dispensasjon godkjent/avslått for ...'.\n\nDocument:\n{}\n",
        text.trim()
    )
}

/// Summarizer backed by a local Ollama runtime.
pub struct OllamaSummarizationClient {
    http: Client,
    base_url: String,
    model: String,
    max_words: usize,
}

impl OllamaSummarizationClient {
    /// Build a client targeting `base_url` with the given model and word budget.
    pub fn new(
        base_url: String,
        model: String,
        max_words: usize,
    ) -> Result<Self, SummarizationClientError> {
        let http = Client::builder()
            .user_agent("arkivgist/summary")
            .build()
            .map_err(|error| SummarizationClientError::ProviderUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            model,
            max_words,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[async_trait]
impl SummarizationClient for OllamaSummarizationClient {
    async fn summarize(&self, text: &str) -> Result<String, SummarizationClientError> {
        if text.trim().is_empty() {
            return Err(SummarizationClientError::EmptyInput);
        }

        let payload = json!({
            "model": self.model,
            "prompt": build_prompt(text, self.max_words),
            "stream": false,
            "options": {
                // Lower temperature for deterministic summaries.
                "temperature": 0.1,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                SummarizationClientError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SummarizationClientError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizationClientError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            SummarizationClientError::InvalidResponse(format!(
                "failed to decode Ollama response: {error}"
            ))
        })?;

        if !body.done {
            return Err(SummarizationClientError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response.trim().to_string())
    }
}

/// Summarizer that returns its input unchanged.
pub struct EchoSummarizationClient;

#[async_trait]
impl SummarizationClient for EchoSummarizationClient {
    async fn summarize(&self, text: &str) -> Result<String, SummarizationClientError> {
        if text.trim().is_empty() {
            return Err(SummarizationClientError::EmptyInput);
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn client(server: &MockServer) -> OllamaSummarizationClient {
        OllamaSummarizationClient::new(server.base_url(), "llama".into(), 15).expect("client")
    }

    #[tokio::test]
    async fn ollama_client_handles_successful_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .body_contains("\"model\":\"llama\"")
                    .body_contains("Dispensasjon");
                then.status(200).json_body(json!({
                    "response": " 2021: Dispensasjon godkjent for deling \n",
                    "done": true
                }));
            })
            .await;

        let summary = client(&server)
            .summarize("Søknad om deling av eiendom")
            .await
            .expect("summary");

        mock.assert();
        assert_eq!(summary, "2021: Dispensasjon godkjent for deling");
    }

    #[tokio::test]
    async fn ollama_client_handles_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(500).body("boom");
            })
            .await;

        let error = client(&server)
            .summarize("Tekst")
            .await
            .expect_err("error response");

        assert!(
            matches!(error, SummarizationClientError::GenerationFailed(message) if message.contains("500"))
        );
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_a_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200);
            })
            .await;

        let error = client(&server).summarize("  \n").await.expect_err("empty");
        assert!(matches!(error, SummarizationClientError::EmptyInput));
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn echo_client_returns_input() {
        let summary = EchoSummarizationClient
            .summarize("Vedtak 2020")
            .await
            .expect("echo");
        assert_eq!(summary, "Vedtak 2020");
    }

    #[test]
    fn prompt_carries_word_budget_and_text() {
        let prompt = build_prompt("  Innhold  ", 15);
        assert!(prompt.contains("fewer than 15 words"));
        assert!(prompt.ends_with("Innhold\n"));
    }
}
