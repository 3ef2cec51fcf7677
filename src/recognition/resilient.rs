//! Recognition calls under a timeout, a cancellation token, and the shared circuit breaker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::breaker::{CircuitBreaker, CircuitState};
use super::client::{RecognitionClient, RecognitionError};

/// Failures of a guarded recognition call.
#[derive(Debug, Error)]
pub enum RecognitionCallError {
    /// The breaker is open; the remote service was not contacted.
    #[error("recognition circuit is open")]
    CircuitOpen,
    /// The caller cancelled the batch.
    #[error("recognition cancelled")]
    Cancelled,
    /// The call exceeded its time budget.
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),
    /// The remote service failed.
    #[error(transparent)]
    Failed(#[from] RecognitionError),
}

/// Recognition client wrapped in the process-wide resilience policy.
#[derive(Clone)]
pub struct ResilientRecognizer {
    client: Arc<dyn RecognitionClient>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl ResilientRecognizer {
    /// Wrap `client` with `breaker` and a per-call `timeout`.
    pub fn new(
        client: Arc<dyn RecognitionClient>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            breaker,
            timeout,
        }
    }

    /// Shared breaker guarding the calls.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Recognize the document at `file_path`, aborting on timeout or cancellation.
    pub async fn call(
        &self,
        file_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, RecognitionCallError> {
        if cancel.is_cancelled() {
            return Err(RecognitionCallError::Cancelled);
        }
        let permit = self
            .breaker
            .try_acquire()
            .map_err(|_| RecognitionCallError::CircuitOpen)?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.timeout, self.client.recognize(file_path)) => Some(result),
        };

        match outcome {
            // Dropping the permit unsettled keeps caller cancellations out of the statistics.
            None => Err(RecognitionCallError::Cancelled),
            Some(Ok(Ok(text))) => {
                permit.succeeded();
                Ok(text)
            }
            Some(Ok(Err(error))) => {
                permit.failed();
                Err(RecognitionCallError::Failed(error))
            }
            Some(Err(_elapsed)) => {
                permit.failed();
                Err(RecognitionCallError::Timeout(self.timeout))
            }
        }
    }
}
