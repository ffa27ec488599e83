//! Error types for convoforge operations.
//!
//! Defines error types for the major subsystems:
//! - Scoped configuration (override derivation, context lookup, env/file loading)
//! - Rate limiting
//! - Checkpoint persistence
//! - Task execution
//! - LLM API interactions

use std::path::PathBuf;

use thiserror::Error;

/// Error raised by a [`Processor`](crate::task::Processor) for a single item.
///
/// Processors may fail with any error type; the original error is preserved
/// and can be recovered with `downcast_ref`.
pub type ProcessError = anyhow::Error;

/// Errors that can occur while building or deriving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration context '{0}' is not registered")]
    ContextNotFound(String),

    #[error("Override key '{key}' is ambiguous: it belongs to sections {sections:?}")]
    AmbiguousKey { key: String, sections: Vec<String> },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur when constructing a rate limiter.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Invalid rate {0}: must be a finite, non-negative number of requests per second")]
    InvalidRate(f64),
}

/// Errors that can occur while reading or writing the checkpoint log.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint log '{path}': {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint id {0:?} is empty, padded, or spans several lines")]
    InvalidId(String),

    #[error("Failed to append to checkpoint log '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that terminate a task run.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A processor failure under a policy that does not tolerate errors.
    #[error("Processing failed for item '{item_id}' (position {index}): {error}")]
    Processing {
        item_id: String,
        index: usize,
        error: ProcessError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Rate limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A worker task panicked or was cancelled unexpectedly.
    #[error("Worker '{worker_id}' terminated abnormally: {message}")]
    WorkerFailed { worker_id: String, message: String },
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}
