//! Error types for docshard operations
//!
//! This module defines the error taxonomy used throughout the crate: usage
//! errors, not-found conditions, concurrency violations, and I/O failures.
//! A missing store file on load is deliberately *not* an error (it means an
//! empty store), and a duplicate `_id` on insert is a logged skip rather
//! than a failure.

use crate::guard::ConcurrencyViolation;
use thiserror::Error;

/// Main error type for all docshard operations
#[derive(Debug, Error)]
pub enum DocshardError {
    /// IO operations failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was absent from a document or query
    #[error("Missing field for {operation}: {field}")]
    MissingField { operation: String, field: String },

    /// `update` was asked to modify an `_id` that is not in the id index
    #[error("Document not found for _id: {id}")]
    NotFound { id: String },

    /// A strict single-`_id` lookup missed the id index
    #[error("No index entry for _id: {id}")]
    IndexNotFound { id: String },

    /// A removal query on the sharded store did not name exactly one shard
    #[error("Invalid remove query: {reason}")]
    InvalidRemoveQuery { reason: String },

    /// A query object could not be normalized into the query language
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// Configuration validation failed
    #[error("Configuration error: {field} - {reason}")]
    Config { field: String, reason: String },

    /// An illegal interleaving was detected by the access guard (strict mode)
    #[error("Concurrent access violation: {0}")]
    Concurrency(Box<ConcurrencyViolation>),
}

impl DocshardError {
    /// Create a missing-field usage error
    pub fn missing_field(operation: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            operation: operation.into(),
            field: field.into(),
        }
    }

    /// Create an invalid-query usage error
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    /// Create a configuration validation error
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True when this error is a not-found condition rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::IndexNotFound { .. })
    }
}
