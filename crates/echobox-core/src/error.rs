//! Error types and result handling for job store operations.
//!
//! Defines the structured error taxonomy shared by the repository layer and
//! the HTTP surface. Conflict errors carry enough context for callers to
//! distinguish "not found" from "wrong lifecycle state".

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for store and lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation rejected because the job is in an incompatible lifecycle
    /// state (e.g. cancelling a delivered job).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid input rejected before reaching the store.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::Conflict(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn error_display_is_lowercase_prefixed() {
        assert_eq!(
            CoreError::Conflict("job already delivered".into()).to_string(),
            "conflict: job already delivered"
        );
        assert_eq!(
            CoreError::InvalidInput("phone required for sms".into()).to_string(),
            "invalid input: phone required for sms"
        );
    }
}
