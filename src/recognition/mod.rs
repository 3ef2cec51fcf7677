//! Text recognition: the remote collaborator plus the resilience policy around it.

pub mod breaker;
mod client;
mod resilient;

pub use breaker::{BreakerPolicy, CircuitBreaker, CircuitState};
pub use client::{HttpRecognitionClient, RecognitionClient, RecognitionError};
pub use resilient::{RecognitionCallError, ResilientRecognizer};
