//! Error types for codeintel-store

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Storage error kinds
///
/// Row-lock contention has no kind: a contended row is simply missing from
/// the batch that tried to claim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upload, index or repository absent (or already hard-deleted)
    NotFound,
    /// Requested transition is not allowed from the current state
    IllegalStateTransition,
    /// Database connectivity or query errors
    Database,
    /// Transaction begin/commit/rollback errors
    Transaction,
    /// Row decoding and serialization errors
    Serialization,
    /// Configuration errors
    Config,
    /// Repository visibility predicate failed
    Authorization,
    /// Operation stopped by a cancellation signal
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::IllegalStateTransition => "illegal_state_transition",
            ErrorKind::Database => "database",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Config => "config",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether the failure is visible to API callers as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::Database | ErrorKind::Transaction
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn upload_not_found(id: i64) -> Self {
        Self::new(ErrorKind::NotFound, format!("Upload not found: {}", id))
    }

    pub fn index_not_found(id: i64) -> Self {
        Self::new(ErrorKind::NotFound, format!("Index not found: {}", id))
    }

    pub fn repository_not_found(id: i64) -> Self {
        Self::new(ErrorKind::NotFound, format!("Repository not found: {}", id))
    }

    pub fn illegal_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::IllegalStateTransition,
            format!("Illegal state transition: {} -> {}", from, to),
        )
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("{} cancelled", operation))
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => {
                StorageError::serialization(format!("Row decode error: {}", err)).with_source(err)
            }
            _ => StorageError::database(format!("PostgreSQL error: {}", err)).with_source(err),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<ConfigError> for StorageError {
    fn from(err: ConfigError) -> Self {
        StorageError::new(ErrorKind::Config, err.to_string()).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
