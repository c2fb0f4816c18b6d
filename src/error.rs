//! Error taxonomy for the detection engine.
//!
//! Only configuration and validation failures reach callers. Detector edge
//! cases are abstentions (see [`crate::signal::AbstainReason`]) and storage
//! failures are logged by the persistence writer.

use thiserror::Error;

/// Caller-facing engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed session-init or point payload. The session is untouched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The client id is already registered and active.
    #[error("session already active: {0}")]
    DuplicateSession(String),

    /// No session exists for the client id.
    #[error("unknown session: {0}")]
    NotFound(String),

    /// Invalid window or detector parameters, raised at session creation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The session was deactivated; new points are refused.
    #[error("session is inactive: {0}")]
    SessionInactive(String),

    /// The worker pool is shutting down and cannot take more work.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Stable lowercase code used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::NotFound(_) => "not_found",
            Self::Configuration(_) => "configuration",
            Self::SessionInactive(_) => "session_inactive",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Failure inside the persistence collaborator. Never aborts detection.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            EngineError::SessionInactive("c1".into()).kind(),
            "session_inactive"
        );
        assert_eq!(
            EngineError::DuplicateSession("c1".into()).to_string(),
            "session already active: c1"
        );
    }
}
