use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassificationError {
    #[error("Classification request timed out")]
    Timeout,
    #[error("Rate limited by classification service")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Classification service unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid classification response: {0}")]
    InvalidResponse(String),
    #[error("Authentication failed: {0}")]
    AuthFailure(String),
    #[error("Classification service misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    Unavailable,
    InvalidResponse,
    AuthFailure,
    Misconfigured,
}

impl ClassificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassificationError::Timeout => ErrorKind::Timeout,
            ClassificationError::RateLimited { .. } => ErrorKind::RateLimited,
            ClassificationError::Unavailable(_) => ErrorKind::Unavailable,
            ClassificationError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            ClassificationError::AuthFailure(_) => ErrorKind::AuthFailure,
            ClassificationError::Misconfigured(_) => ErrorKind::Misconfigured,
        }
    }

    /// Worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Every later call would fail the same way; the run must stop calling out.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClassificationError::AuthFailure(_) | ClassificationError::Misconfigured(_)
        )
    }
}
