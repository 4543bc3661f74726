//! Error taxonomy for the ingestion pipeline.
//!
//! Task-level failures are classified so the retry policy can tell a
//! transient problem (worth another attempt) from a permanent one.

use std::time::Duration;

use crate::models::EntityKind;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A bounded wait expired (store call, DB worker reply).
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// A referenced slug does not exist in the store.
    #[error("{kind} not found: {slug} (referenced from {origin})")]
    NotFound {
        kind: EntityKind,
        slug: String,
        origin: String,
    },

    /// A document is missing required fields or has a malformed slug.
    #[error("validation failed for {path}: {}", .problems.join("; "))]
    Validation { path: String, problems: Vec<String> },

    /// The task queue stayed full past the submit bound.
    #[error("timed out submitting task for {path}")]
    SubmissionTimeout { path: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("failed to upload {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("embedding failed for {path}: {source}")]
    Embedding {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("store error during {operation}: {source}")]
    Store {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Relationship resolution gave up; wraps the last attempt's failure.
    #[error("relationships for {path} abandoned after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// The pipeline is shutting down and the request could not be serviced.
    #[error("pipeline closed")]
    Closed,
}

impl PipelineError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// `NotFound` is reported separately by [`is_not_found`](Self::is_not_found)
    /// because whether it is retried is a policy decision.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Timeout { .. } => true,
            PipelineError::Store { source, .. } => is_busy(source),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound { .. })
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        PipelineError::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn store(operation: impl Into<String>, source: anyhow::Error) -> Self {
        PipelineError::Store {
            operation: operation.into(),
            source,
        }
    }
}

/// SQLite reports contention as "database is locked" or "database table is locked".
fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string();
        msg.contains("is locked") || msg.contains("database is busy")
    })
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
