//! Error types for codeintel-gittree

use thiserror::Error;

/// Errors raised while obtaining or parsing diff text.
///
/// A position that lands on a changed line is not an error: translation
/// functions report it as `None`.
#[derive(Debug, Error)]
pub enum DiffError {
    /// The diff text could not be parsed into hunks
    #[error("malformed diff input at line {line}: {reason}")]
    MalformedDiffInput { line: usize, reason: String },

    /// The diff provider failed to produce a diff
    #[error("diff source error: {0}")]
    DiffSource(String),
}

impl DiffError {
    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        DiffError::MalformedDiffInput {
            line,
            reason: reason.into(),
        }
    }

    pub fn diff_source(message: impl Into<String>) -> Self {
        DiffError::DiffSource(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DiffError>;
