//! HTTP surface for the enrichment pipeline.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /summaries` – Run a batch for a case folder and stream one JSON result per line
//!   (`application/x-ndjson`) as documents complete. Closing the connection cancels the batch.
//! - `GET /metrics` – Observe pipeline counters accumulated since startup.
//! - `GET /circuit` – Current state of the recognition circuit breaker.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.

use crate::archive::DocumentKey;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::{EnrichmentApi, PipelineResult};
use crate::recognition::CircuitState;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Results buffered between the pipeline and a slow HTTP client.
const RESULT_BUFFER: usize = 16;

/// Build the HTTP router exposing the enrichment API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: EnrichmentApi + 'static,
{
    Router::new()
        .route("/summaries", post(stream_summaries::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/circuit", get(get_circuit::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

/// Run a batch and stream its results as newline-delimited JSON.
///
/// The batch runs on its own task. A drop guard tied to the response body cancels it as soon
/// as the client goes away. A batch-level failure (for example a failed archive search) is
/// reported as a final `{"error": ...}` line, since the status line is already sent.
async fn stream_summaries<S>(
    State(service): State<Arc<S>>,
    Json(key): Json<DocumentKey>,
) -> Response
where
    S: EnrichmentApi + 'static,
{
    let (tx, mut rx) = mpsc::channel::<PipelineResult>(RESULT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let worker = tokio::spawn(async move { service.process(key, tx, cancel).await });

    let body = async_stream::stream! {
        let _guard = guard;
        while let Some(result) = rx.recv().await {
            if let Some(line) = ndjson_line(&result) {
                yield Ok::<Bytes, Infallible>(line);
            }
        }
        match worker.await {
            Ok(Ok(report)) => {
                tracing::info!(batch = %key, emitted = report.emitted, failed = report.failed, "Summary stream finished");
            }
            Ok(Err(error)) => {
                tracing::warn!(batch = %key, error = %error, "Batch failed");
                if let Some(line) = ndjson_line(&json!({ "error": error.to_string() })) {
                    yield Ok(line);
                }
            }
            Err(error) => {
                tracing::error!(batch = %key, error = %error, "Batch task aborted");
            }
        }
    };

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

fn ndjson_line<T: Serialize>(value: &T) -> Option<Bytes> {
    match serde_json::to_vec(value) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(error) => {
            tracing::warn!(error = %error, "Failed to encode stream line");
            None
        }
    }
}

/// Return the pipeline counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: EnrichmentApi,
{
    Json(service.metrics_snapshot())
}

/// Response body for `GET /circuit`.
#[derive(Serialize)]
struct CircuitResponse {
    state: CircuitState,
}

/// Report whether recognition calls are currently admitted.
async fn get_circuit<S>(State(service): State<Arc<S>>) -> Json<CircuitResponse>
where
    S: EnrichmentApi,
{
    Json(CircuitResponse {
        state: service.circuit_state(),
    })
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "summaries",
                method: "POST",
                path: "/summaries",
                description: "Export, recognize, and summarize every decision filed under a case folder. Streams one { \"sequence_id\", \"summary\", \"document\" } object per line as documents complete.",
                request_example: Some(json!({
                    "group": 12,
                    "subgroup": 34,
                    "section": 0
                })),
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return pipeline counters useful for observability dashboards.",
                request_example: None,
            },
            CommandDescriptor {
                name: "circuit",
                method: "GET",
                path: "/circuit",
                description: "Return the recognition circuit breaker state (closed, open, half_open).",
                request_example: None,
            },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::{create_router, get_commands};
    use crate::archive::DocumentKey;
    use crate::metrics::MetricsSnapshot;
    use crate::pipeline::{BatchReport, EnrichmentApi, PipelineError, PipelineResult};
    use crate::recognition::CircuitState;
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify, mpsc};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    #[tokio::test]
    async fn commands_catalog_exposes_summaries_endpoint() {
        let response = get_commands().await;
        let commands = response.0.commands;
        let summaries = commands
            .iter()
            .find(|cmd| cmd.name == "summaries")
            .expect("summaries command present");

        assert_eq!(summaries.method, "POST");
        assert_eq!(summaries.path, "/summaries");
        assert!(commands.len() >= 3);
    }

    #[tokio::test]
    async fn summaries_route_streams_ndjson_results() {
        let service = Arc::new(StubService::new(Behavior::Emit(vec![
            result(1, "2020: Dispensasjon godkjent", "doc-b"),
            result(0, "2019: Dispensasjon avslått", "doc-a"),
        ])));
        let app = create_router(service.clone());

        let response = app
            .oneshot(summaries_request(json!({"group": 12, "subgroup": 34, "section": 0})))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/x-ndjson");
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&body)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["sequence_id"], 1);
        assert_eq!(lines[0]["document"], "doc-b");
        assert_eq!(lines[1]["summary"], "2019: Dispensasjon avslått");
        assert_eq!(
            service.keys.lock().await.as_slice(),
            &[DocumentKey::new(12, 34, 0)]
        );
    }

    #[tokio::test]
    async fn batch_failure_is_reported_as_trailing_line() {
        let service = Arc::new(StubService::new(Behavior::FailSearch));
        let app = create_router(service);

        let response = app
            .oneshot(summaries_request(json!({"group": 1, "subgroup": 2, "section": 3})))
            .await
            .expect("router response");
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let text = std::str::from_utf8(&body).expect("utf8");
        let last: serde_json::Value =
            serde_json::from_str(text.lines().last().expect("one line")).expect("json");
        assert!(last["error"].as_str().expect("error text").contains("search"));
    }

    #[tokio::test]
    async fn malformed_request_is_rejected() {
        let app = create_router(Arc::new(StubService::new(Behavior::Emit(vec![]))));
        let response = app
            .oneshot(summaries_request(json!({"group": "twelve"})))
            .await
            .expect("router response");
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn dropping_the_response_cancels_the_batch() {
        let service = Arc::new(StubService::new(Behavior::WaitForCancel));
        let app = create_router(service.clone());

        let response = app
            .oneshot(summaries_request(json!({"group": 1, "subgroup": 1, "section": 1})))
            .await
            .expect("router response");
        service.started.notified().await;
        let token = service.token.lock().await.clone().expect("token recorded");
        assert!(!token.is_cancelled());

        drop(response);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("batch cancelled after disconnect");
    }

    #[tokio::test]
    async fn metrics_and_circuit_routes_report_service_state() {
        let app = create_router(Arc::new(StubService::new(Behavior::Emit(vec![]))));

        let metrics = app
            .clone()
            .oneshot(get_request("/metrics"))
            .await
            .expect("metrics response");
        let body = to_bytes(metrics.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["summaries_emitted"], 7);
        assert_eq!(json["circuit_openings"], 1);

        let circuit = app
            .oneshot(get_request("/circuit"))
            .await
            .expect("circuit response");
        let body = to_bytes(circuit.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["state"], "half_open");
    }

    fn result(sequence_id: usize, summary: &str, document: &str) -> PipelineResult {
        PipelineResult {
            sequence_id,
            summary: summary.into(),
            document: document.into(),
        }
    }

    fn summaries_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/summaries")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    enum Behavior {
        Emit(Vec<PipelineResult>),
        FailSearch,
        WaitForCancel,
    }

    struct StubService {
        behavior: Behavior,
        keys: Mutex<Vec<DocumentKey>>,
        token: Mutex<Option<CancellationToken>>,
        started: Notify,
    }

    impl StubService {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                keys: Mutex::new(Vec::new()),
                token: Mutex::new(None),
                started: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl EnrichmentApi for StubService {
        async fn process(
            &self,
            key: DocumentKey,
            sink: mpsc::Sender<PipelineResult>,
            cancel: CancellationToken,
        ) -> Result<BatchReport, PipelineError> {
            self.keys.lock().await.push(key);
            *self.token.lock().await = Some(cancel.clone());
            self.started.notify_one();

            match &self.behavior {
                Behavior::Emit(results) => {
                    for result in results {
                        sink.send(result.clone()).await.expect("receiver alive");
                    }
                    Ok(BatchReport {
                        found: results.len(),
                        downloaded: results.len(),
                        emitted: results.len(),
                        ..BatchReport::default()
                    })
                }
                Behavior::FailSearch => Err(PipelineError::Search(
                    crate::archive::ArchiveError::UnexpectedStatus {
                        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                        body: "maintenance".into(),
                    },
                )),
                Behavior::WaitForCancel => {
                    cancel.cancelled().await;
                    Ok(BatchReport::default())
                }
            }
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                summaries_emitted: 7,
                circuit_openings: 1,
                ..MetricsSnapshot::default()
            }
        }

        fn circuit_state(&self) -> CircuitState {
            CircuitState::HalfOpen
        }
    }
}
