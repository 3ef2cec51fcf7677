#![deny(missing_docs)]

//! Core library for the arkivgist document enrichment service.

/// HTTP routing and REST handlers.
pub mod api;
/// Document archive client and export polling.
pub mod archive;
/// Idempotency cache for computed summaries.
pub mod cache;
/// Environment-driven configuration management.
pub mod config;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline metrics helpers.
pub mod metrics;
/// Batch orchestration.
pub mod pipeline;
/// Text recognition with circuit breaking.
pub mod recognition;
/// Summarization client abstraction and adapters.
pub mod summarization;
