#![forbid(unsafe_code)]
//! Error types for grist.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace.

use grist_types::PageOffset;
use thiserror::Error;

/// Unified error type for cache and I/O operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: requested {requested} pages, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("writeback failed at offset {offset}: {detail}")]
    IoFailure { offset: PageOffset, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// True for errors the cache treats as transient: a later flush or
    /// expand attempt may succeed without any caller intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::IoFailure { .. } | Self::Io(_)
        )
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_transient() {
        let err = CacheError::OutOfMemory {
            requested: 16,
            available: 3,
        };
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "out of memory: requested 16 pages, 3 available"
        );
    }

    #[test]
    fn invalid_operation_is_not_transient() {
        let err = CacheError::InvalidOperation("add_pages past cell capacity".to_owned());
        assert!(!err.is_transient());
    }
}
