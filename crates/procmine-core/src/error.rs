// Error types for the mining engine

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the mining engine.
///
/// Each variant maps to one code of the wire-level error taxonomy; the API
/// layer derives the HTTP status from `code()`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Entity id unknown
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Uniqueness violation, e.g. duplicate (type, name) with divergent data
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed regex, unparsable time range, bad template placeholder
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation forbidden by current state (e.g. delete a type in use)
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A singleton job is already running
    #[error("analysis job already in progress: {0}")]
    JobInProgress(Uuid),

    /// Enrichment provider exhausted retries; recorded on the task, never
    /// surfaced to interactive clients
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Wire-level error code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::PreconditionFailed(_) => "precondition_failed",
            EngineError::JobInProgress(_) => "job_in_progress",
            EngineError::ProviderUnavailable(_) => "provider_unavailable",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    /// Create a precondition-failed error
    pub fn precondition(msg: impl Into<String>) -> Self {
        EngineError::PreconditionFailed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::not_found("object", "x").code(), "not_found");
        assert_eq!(EngineError::conflict("dup").code(), "conflict");
        assert_eq!(EngineError::invalid("bad regex").code(), "invalid_argument");
        assert_eq!(EngineError::precondition("in use").code(), "precondition_failed");
        assert_eq!(EngineError::JobInProgress(Uuid::nil()).code(), "job_in_progress");
    }
}
