//! Error types for the memory engine.
//!
//! Library operations return [`MemoryError`] so callers can tell an overloaded
//! engine ([`MemoryError::AdmissionRejected`]) or a missing id
//! ([`MemoryError::NotFound`]) apart from storage and collaborator failures.
//! Configuration loading and the binary stick to `anyhow`.

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// The concurrent query limit is reached. No slot was consumed.
    #[error("query rejected: {active} of {max} query slots in use")]
    AdmissionRejected { active: usize, max: usize },

    #[error("memory not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// A write failed and was rolled back.
    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// `true` for errors a caller may retry or ignore without treating the
    /// store as broken.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. } | Self::Timeout { .. } | Self::NotFound(_)
        )
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}

impl From<anyhow::Error> for MemoryError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
