//! Error taxonomy shared by every DAO backend.
//!
//! Each variant carries an HTTP-analog status code so the route layer can
//! translate failures without knowing which backend produced them.

use thiserror::Error;

/// Errors returned by DAO operations.
#[derive(Debug, Error)]
pub enum DaoError {
    /// Resource contention; the caller may retry later.
    #[error("Locked: {0}")]
    Locked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate unique key.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is not supported by the active backend.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Invariant violation, e.g. a dangling secondary index entry.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for DAO operations.
pub type DaoResult<T> = Result<T, DaoError>;

impl DaoError {
    pub fn locked(message: impl Into<String>) -> Self {
        DaoError::Locked(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DaoError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        DaoError::Conflict(message.into())
    }

    pub fn not_implemented(operation: &str) -> Self {
        DaoError::NotImplemented(format!("{} is not supported by this backend", operation))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DaoError::Internal(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        DaoError::Config(message.into())
    }

    /// HTTP status code equivalent for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DaoError::Locked(_) => 423,
            DaoError::NotFound(_) => 404,
            DaoError::Conflict(_) => 409,
            DaoError::NotImplemented(_) => 501,
            DaoError::Config(_) => 400,
            DaoError::Internal(_) | DaoError::Database(_) | DaoError::Io(_) | DaoError::Json(_) => {
                500
            }
        }
    }

    /// Whether a later retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaoError::Locked(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(DaoError::locked("users").status_code(), 423);
        assert_eq!(DaoError::not_found("user x").status_code(), 404);
        assert_eq!(DaoError::conflict("email").status_code(), 409);
        assert_eq!(DaoError::not_implemented("auditlog.getAll").status_code(), 501);
        assert_eq!(DaoError::internal("dangling").status_code(), 500);
        assert_eq!(DaoError::config("basePath").status_code(), 400);
    }

    #[test]
    fn test_io_error_maps_to_internal_status() {
        let err: DaoError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.status_code(), 500);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_only_locked_is_retryable() {
        assert!(DaoError::locked("x").is_retryable());
        assert!(!DaoError::conflict("x").is_retryable());
    }

    #[test]
    fn test_not_implemented_message_names_operation() {
        let err = DaoError::not_implemented("accessTokens.insert");
        assert!(err.to_string().contains("accessTokens.insert"));
    }
}
