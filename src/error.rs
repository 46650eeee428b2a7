//! Replibus Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for Replibus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Replibus error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Bus channel closed")]
    ChannelClosed,

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} is locked by another connection")]
    ResourceLocked(String),

    // Codec errors
    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Frame serialization error: {0}")]
    Frame(#[from] bincode::Error),

    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store rejected statement{}: {message}", code_suffix(.code))]
    Store {
        code: Option<String>,
        message: String,
        retryable: bool,
    },

    // Protocol errors
    #[error("No reply for request {request_id} within {after:?}")]
    ReplyTimeout { request_id: String, after: Duration },

    #[error("Request id already in flight: {0}")]
    DuplicateRequestId(String),

    #[error("Statement is empty")]
    EmptyStatement,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { retryable, .. } => *retryable,
            Error::Database(e) => sqlx_is_retryable(e),
            Error::ConnectionTimeout(_)
            | Error::ConnectionFailed { .. }
            | Error::Transport(_)
            | Error::ChannelClosed => true,
            _ => false,
        }
    }

    /// Check if this error came from the message bus rather than the payload or the store
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ChannelClosed
                | Error::ExchangeNotFound(_)
                | Error::QueueNotFound(_)
                | Error::ResourceLocked(_)
                | Error::Frame(_)
        )
    }

    /// Store-reported error code (SQLSTATE for PostgreSQL, extended result code for SQLite)
    pub fn store_code(&self) -> Option<String> {
        match self {
            Error::Store { code, .. } => code.clone(),
            Error::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default()
}

/// Classify a sqlx error as transient.
///
/// Connection-level failures are always transient. For server-reported errors the
/// SQLSTATE class decides: 08 (connection), 40 (rollback/serialization),
/// 53 (insufficient resources), 57 (operator intervention), 58 (system error).
fn sqlx_is_retryable(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| sqlstate_is_retryable(&code))
            .unwrap_or(false),
        _ => false,
    }
}

pub(crate) fn sqlstate_is_retryable(code: &str) -> bool {
    matches!(code.get(..2), Some("08" | "40" | "53" | "57" | "58"))
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let (code, retryable) = match &e {
            rusqlite::Error::SqliteFailure(err, _) => (
                Some(err.extended_code.to_string()),
                matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ),
            ),
            _ => (None, false),
        };
        Error::Store {
            code,
            message: format!("SQLite error: {}", e),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classes() {
        assert!(sqlstate_is_retryable("08006"));
        assert!(sqlstate_is_retryable("40001"));
        assert!(sqlstate_is_retryable("57P01"));
        assert!(!sqlstate_is_retryable("42P01"));
        assert!(!sqlstate_is_retryable("23505"));
        assert!(!sqlstate_is_retryable(""));
    }

    #[test]
    fn test_store_error_display() {
        let err = Error::Store {
            code: Some("42P01".into()),
            message: "relation \"t\" does not exist".into(),
            retryable: false,
        };
        assert_eq!(
            err.to_string(),
            "Store rejected statement [42P01]: relation \"t\" does not exist"
        );
        assert_eq!(err.store_code().as_deref(), Some("42P01"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::ChannelClosed.is_transport());
        assert!(Error::ChannelClosed.is_retryable());
        assert!(!Error::EmptyStatement.is_transport());
    }
}
