// Dispatch Error Types
//
// Shared error taxonomy for the dispatch core. Every stage and handler
// returns these; callers never observe an unwinding panic from dispatch.

use thiserror::Error;

/// Error types for message dispatch.
///
/// All variants are `Clone` so a stored idempotent outcome can be replayed
/// verbatim to every caller presenting the same key.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Message rejected before any side effect was attempted
    #[error("validation failed for {message_type}: {reason}")]
    Validation {
        /// The message type that failed validation
        message_type: &'static str,
        /// Human-readable validation failure
        reason: String,
    },

    /// No handler registered for the message type
    #[error("handler not found for message type: {message_type}")]
    UnregisteredHandler {
        /// The message type that had no handler
        message_type: &'static str,
    },

    /// A second handler was registered for an already-bound message type
    #[error("handler already registered for message type: {message_type}")]
    DuplicateHandler {
        /// The message type that was registered twice
        message_type: &'static str,
    },

    /// Transient failure, eligible for retry
    #[error("transient failure: {reason}")]
    Transient {
        /// What failed
        reason: String,
    },

    /// Fast-fail rejection while the named circuit breaker is open
    #[error("circuit breaker {name} is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
    },

    /// Duplicate command rejected by the idempotency guard
    #[error("duplicate command in flight for idempotency key: {key}")]
    Conflict {
        /// The idempotency key that conflicted
        key: String,
    },

    /// Handler failed for a non-retryable reason
    #[error("handler failed: {reason}")]
    Failed {
        /// The underlying failure
        reason: String,
    },

    /// Unexpected runtime fault caught at the dispatch boundary
    #[error("fatal dispatch fault: {reason}")]
    Fatal {
        /// What went wrong
        reason: String,
    },
}

/// Coarse error class, used by the retry stage to decide eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Validation,
    UnregisteredHandler,
    DuplicateHandler,
    Transient,
    CircuitOpen,
    Conflict,
    Failed,
    Fatal,
}

impl DispatchError {
    /// The coarse class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::UnregisteredHandler { .. } => ErrorKind::UnregisteredHandler,
            Self::DuplicateHandler { .. } => ErrorKind::DuplicateHandler,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Failed { .. } => ErrorKind::Failed,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether this error is classified retryable by default.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether this error was produced by the validation stage.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Convenience constructor for transient failures.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for non-retryable handler failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Rejection produced by a message's validation hook.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ValidationError {
    /// Why the message was rejected
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Result type for message dispatch.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            DispatchError::transient("timeout").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DispatchError::CircuitOpen {
                name: "jobs".to_string()
            }
            .kind(),
            ErrorKind::CircuitOpen
        );
        assert_eq!(
            DispatchError::Validation {
                message_type: "CreateJob",
                reason: "empty spec".to_string()
            }
            .kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn transient_classification() {
        assert!(DispatchError::transient("timeout").is_transient());
        assert!(!DispatchError::failed("bad state").is_transient());
        assert!(!DispatchError::CircuitOpen {
            name: "jobs".to_string()
        }
        .is_transient());
    }

    #[test]
    fn display_carries_context() {
        let err = DispatchError::Conflict {
            key: "key-123".to_string(),
        };
        assert!(err.to_string().contains("key-123"));

        let err = DispatchError::UnregisteredHandler {
            message_type: "CreateJob",
        };
        assert!(err.to_string().contains("CreateJob"));
    }

    #[test]
    fn errors_are_clone() {
        let err = DispatchError::Fatal {
            reason: "handler panicked".to_string(),
        };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn result_has_exactly_one_variant() {
        let ok: DispatchResult<u32> = Ok(7);
        assert!(ok.is_ok() && !ok.is_err());
        assert_eq!(ok.map(|v| v + 1).expect("mapped ok"), 8);

        let err: DispatchResult<u32> = Err(DispatchError::transient("io"));
        assert!(err.is_err() && !err.is_ok());
        // and_then must not invoke its callback on the Err variant
        let touched = err.and_then(|_| -> DispatchResult<u32> { panic!("must not run") });
        assert!(touched.is_err());
    }
}
