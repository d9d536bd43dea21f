//! # Authorization Errors
//!
//! Error handling shared by every crate of the authorization engine.
//!
//! - Uses `thiserror` for structured error definitions
//! - Not-found is never an error: loads return `Option`
//! - Persistence failures are propagated unchanged, retry policy belongs to
//!   the caller

use thiserror::Error;

pub type PermsResult<T> = Result<T, PermsError>;

/// SQLSTATE raised when PostgreSQL breaks a lock cycle.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE raised when a transaction cannot be serialized.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// Whether a database error code reports a conflict with a concurrent
/// transaction, which a rerun of the whole transaction resolves.
pub fn is_conflict_sqlstate(code: &str) -> bool {
    matches!(
        code,
        SQLSTATE_DEADLOCK_DETECTED | SQLSTATE_SERIALIZATION_FAILURE
    )
}

/// Errors raised by the permission store, the engine and its collaborators.
#[derive(Debug, Error)]
pub enum PermsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query on {backend} failed: {reason}")]
    Query { backend: String, reason: String },

    #[error("Transaction on {backend} failed: {reason}")]
    Transaction { backend: String, reason: String },

    #[error("User not found: {user_id}")]
    UserNotFound { user_id: i32 },

    #[error("Invalid sub-repository pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Deadline exceeded: {operation} took longer than {timeout_ms}ms")]
    DeadlineExceeded { operation: String, timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error)
}

impl PermsError {
    pub fn query(backend: &str, reason: impl ToString) -> Self {
        Self::Query {
            backend: backend.to_string(),
            reason: reason.to_string()
        }
    }

    pub fn transaction(backend: &str, reason: impl ToString) -> Self {
        Self::Transaction {
            backend: backend.to_string(),
            reason: reason.to_string()
        }
    }

    /// Whether the upstream scheduler may retry the call unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                db.code().is_some_and(|code| is_conflict_sqlstate(&code))
            }
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Self::Transaction { .. } | Self::DeadlineExceeded { .. } => true,
            _ => false
        }
    }
}
