//! Error types for sqlite-session.
//!
//! Defines the error enum shared by sessions, cursors and the schema reflector.

use thiserror::Error;

/// Main error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation attempted on a session whose native handle was already released.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failure reported by the SQLite engine (prepare, step, I/O, constraint violations, etc.)
    #[error("Native error: {0}")]
    Native(String),

    /// A schema metadata rebuild failed; the cache stays stale.
    #[error("Metadata refresh failed: {0}")]
    Refresh(String),

    /// Configuration errors (invalid connection string, bad TOML, unknown open mode, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (statement task lost, malformed metadata rows, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Creates a native engine error with the given message.
    pub fn native(msg: impl Into<String>) -> Self {
        Self::Native(msg.into())
    }

    /// Creates a metadata refresh error with the given message.
    pub fn refresh(msg: impl Into<String>) -> Self {
        Self::Refresh(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the error was caused by using a closed session.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "Connection Error",
            Self::Native(_) => "Engine Error",
            Self::Refresh(_) => "Metadata Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(error: sqlx::Error) -> Self {
        match error.as_database_error() {
            Some(db_error) => Self::Native(db_error.message().to_string()),
            None => Self::Native(error.to_string()),
        }
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
