use thiserror::Error;

pub type Result<T> = std::result::Result<T, StowageError>;

#[derive(Debug, Error)]
pub enum StowageError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported content type: '{0}'")]
    UnsupportedType(String),

    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("file not found: '{0}'")]
    NotFound(String),

    #[error("file is incomplete: expected {expected} chunks, found {found}")]
    FileIncomplete { expected: u32, found: u32 },

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("upload session not found: '{0}'")]
    SessionNotFound(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("{op} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        op: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StowageError {
    /// Stable machine code exposed in API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::FileIncomplete { .. } => "FILE_INCOMPLETE",
            Self::IntegrityFailed(_) => "INTEGRITY_FAILED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a ledger call that failed with this error is worth retrying.
    ///
    /// Admission and integrity errors are permanent; transport-level failures
    /// and timeouts are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LedgerUnavailable(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(StowageError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            StowageError::TooLarge { size: 2, max: 1 }.code(),
            "TOO_LARGE"
        );
        assert_eq!(
            StowageError::FileIncomplete {
                expected: 4,
                found: 3
            }
            .code(),
            "FILE_INCOMPLETE"
        );
        assert_eq!(StowageError::ShuttingDown.code(), "SHUTTING_DOWN");
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StowageError::Connection("reset".into()).is_retryable());
        assert!(StowageError::Timeout("deadline".into()).is_retryable());
        assert!(StowageError::LedgerUnavailable("503".into()).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!StowageError::Validation("bad".into()).is_retryable());
        assert!(!StowageError::NotFound("f".into()).is_retryable());
        assert!(!StowageError::IntegrityFailed("sum".into()).is_retryable());
        assert!(
            !StowageError::RetryExhausted {
                op: "batch",
                attempts: 5,
                last_error: "x".into()
            }
            .is_retryable()
        );
    }
}
