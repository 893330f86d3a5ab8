use std::time::Duration;

use crate::lang::ParseError;
use crate::security::{SecurityViolation, ValidationError};

/// Error surfaced by sessions and the session manager.
///
/// The variants separate unsafe code, code that raised, and infrastructure
/// faults because callers retry them differently: only [`CellError::Timeout`]
/// and [`CellError::Process`] may be retried, a security violation must not be
/// resubmitted unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CellError {
    /// Source could not be parsed.
    #[error("syntax error: {message}")]
    Parse { message: String },

    /// Source parsed but was rejected by the security policy.
    #[error("security violation: {message}")]
    SecurityViolation { message: String },

    /// Validated code raised while executing. Side effects of statements that
    /// ran before the failure remain in the namespace.
    #[error("{kind}: {message}")]
    Evaluation {
        kind: String,
        message: String,
        traceback: Option<String>,
        stdout: String,
    },

    /// No response arrived before the deadline. The worker has been restarted.
    #[error("evaluation timed out after {:.2}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The worker was unreachable, misbehaved, or was cancelled.
    #[error("worker process error: {0}")]
    Process(String),
}

impl CellError {
    /// Stable label used in API responses.
    pub fn kind(&self) -> &str {
        match self {
            CellError::Parse { .. } => "SyntaxError",
            CellError::SecurityViolation { .. } => "SecurityViolation",
            CellError::Evaluation { kind, .. } => kind,
            CellError::Timeout(_) => "Timeout",
            CellError::Process(_) => "ProcessError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CellError::Timeout(_) | CellError::Process(_))
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, CellError::SecurityViolation { .. })
    }
}

impl From<std::io::Error> for CellError {
    fn from(err: std::io::Error) -> Self {
        CellError::Process(err.to_string())
    }
}

impl From<ParseError> for CellError {
    fn from(err: ParseError) -> Self {
        CellError::Parse {
            message: err.to_string(),
        }
    }
}

impl From<SecurityViolation> for CellError {
    fn from(err: SecurityViolation) -> Self {
        CellError::SecurityViolation {
            message: err.message,
        }
    }
}

impl From<ValidationError> for CellError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Parse(err) => err.into(),
            ValidationError::Violation(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_faults_are_retryable() {
        assert!(CellError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CellError::Process("closed".into()).is_retryable());
        assert!(!CellError::SecurityViolation {
            message: "no".into()
        }
        .is_retryable());
        assert!(!CellError::Evaluation {
            kind: "NameError".into(),
            message: "name 'x' is not defined".into(),
            traceback: None,
            stdout: String::new(),
        }
        .is_retryable());
    }

    #[test]
    fn evaluation_kind_passes_through() {
        let err = CellError::Evaluation {
            kind: "ZeroDivisionError".into(),
            message: "division by zero".into(),
            traceback: None,
            stdout: String::new(),
        };
        assert_eq!(err.kind(), "ZeroDivisionError");
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
    }

    #[test]
    fn timeout_message_has_seconds() {
        let err = CellError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "evaluation timed out after 1.50s");
    }
}
