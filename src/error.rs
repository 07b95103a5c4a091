use std::time::Duration;
use thiserror::Error;

/// Pipeline error taxonomy.
///
/// Only provider failures (transient-exhausted or permanent) propagate to the
/// caller as errors. Admission denial, duplicate uploads, and empty retrieval
/// are modeled as non-error outcomes on the operations that produce them.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A transient provider failure (timeout, 5xx, provider-side rate limit)
    /// that persisted through all retry attempts.
    #[error("{provider} request failed after {attempts} attempts: {message}")]
    Transient {
        provider: &'static str,
        attempts: u32,
        message: String,
    },

    /// A permanent provider failure (auth, malformed request). Never retried.
    #[error("{provider} rejected the request: {message}")]
    Permanent {
        provider: &'static str,
        message: String,
    },

    /// The vector index is unreachable or returned a malformed response.
    /// The orchestrator treats this as retrieval-empty, not a hard failure.
    #[error("vector index error: {0}")]
    Index(String),

    /// Request rejected before doing any work (empty session id, oversized
    /// document, bad parameters).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    pub fn transient(provider: &'static str, attempts: u32, message: impl Into<String>) -> Self {
        Self::Transient {
            provider,
            attempts,
            message: message.into(),
        }
    }

    pub fn permanent(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Permanent {
            provider,
            message: message.into(),
        }
    }
}

/// Outcome of a rate-limit admission check. Denial is a first-class outcome,
/// not an error: it carries how long the caller should wait.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitDecision {
    Admitted,
    Denied { retry_after: Duration },
}

impl AdmitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmitDecision::Admitted)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
