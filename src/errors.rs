//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Every failure the
//! watch/handle engine can hit is one of these variants; callers decide from
//! the variant (and the point at which it surfaced) whether an account run
//! ends or only the current handle cycle fails.

use thiserror::Error;

/// Application error type
///
/// Variants carry a human-readable message naming the failed operation.
/// `Clone` so the last fatal error can be kept on the account runtime while
/// also being returned to the supervisor.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Invalid configuration or caller input
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (mailbox)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, rejected bearer token)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Credential acquisition failure (token command failed or printed nothing)
    #[error("credential error: {0}")]
    Credential(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Operation not valid for the account's current phase
    #[error("conflict: {0}")]
    Conflict(String),
    /// The account run was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Internal error (protocol failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error only reports that the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn cancelled_is_distinguished_from_failures() {
        assert!(AppError::Cancelled("shutdown".to_owned()).is_cancelled());
        assert!(!AppError::Internal("boom".to_owned()).is_cancelled());
        assert!(!AppError::invalid("bad").is_cancelled());
    }

    #[test]
    fn display_names_the_category() {
        let err = AppError::AuthFailed("LOGIN rejected".to_owned());
        assert_eq!(err.to_string(), "authentication failed: LOGIN rejected");
    }
}
