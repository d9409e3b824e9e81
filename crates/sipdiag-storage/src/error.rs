//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The configured match expression failed to compile.
    #[error("invalid match expression {expression:?}: {message}")]
    InvalidMatchExpression {
        /// The source pattern.
        expression: String,
        /// Compiler message.
        message: String,
    },

    /// A display filter expression failed to compile.
    #[error("invalid filter expression {expression:?}: {message}")]
    InvalidFilterExpression {
        /// The source pattern.
        expression: String,
        /// Compiler message.
        message: String,
    },

    /// The consumer is already running.
    #[error("storage consumer already started")]
    AlreadyStarted,

    /// The retained-packet memory cap was hit.
    #[error("memory limit of {limit} bytes reached ({used} bytes retained)")]
    MemoryLimit {
        /// Configured cap.
        limit: usize,
        /// Retained bytes at check time.
        used: usize,
    },
}
