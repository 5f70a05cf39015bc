//! Closed error taxonomy for the sync-and-search pipeline.
//!
//! Every failure crossing a component boundary is one of four variants:
//!
//! | Variant | Meaning | Retried? |
//! |---------|---------|----------|
//! | [`PipelineError::Validation`] | Bad query or parameters | no |
//! | [`PipelineError::Transient`] | Timeout, rate limit, dependency outage | yes, with backoff |
//! | [`PipelineError::PermanentRecord`] | Malformed source record | no, skipped and counted |
//! | [`PipelineError::NotFound`] | Id absent from the source of truth | no |
//!
//! The HTTP layer maps these to response codes; nothing else in the crate
//! inspects error strings.

use std::fmt;

use crate::models::RecordId;

/// External dependency that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Source,
    Embedding,
    Index,
    Summarization,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dependency::Source => "source repository",
            Dependency::Embedding => "embedding provider",
            Dependency::Index => "vector index",
            Dependency::Summarization => "summarization provider",
        };
        f.write_str(name)
    }
}

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The request itself is invalid; reported to the caller immediately.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A dependency failed in a way that is safe to retry.
    #[error("{dependency} failed after {attempts} attempt(s): {message}")]
    Transient {
        dependency: Dependency,
        attempts: u32,
        message: String,
    },

    /// The source record cannot be indexed no matter how often we retry.
    #[error("record {id} is malformed: {reason}")]
    PermanentRecord { id: RecordId, reason: String },

    /// The id does not exist in the source of truth.
    #[error("record {0} not found")]
    NotFound(RecordId),
}

impl PipelineError {
    /// Single-attempt transient failure; the retry layer bumps `attempts`
    /// when it gives up.
    pub fn transient(dependency: Dependency, message: impl Into<String>) -> Self {
        PipelineError::Transient {
            dependency,
            attempts: 1,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    /// Whether the retry layer may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
