//! Error types for prioq.
//!
//! This module provides the crate-wide error type, built with the thiserror
//! crate. Store-level failures are described by
//! [`StorageError`](crate::storage::StorageError) and convert into
//! [`QueueError`] at the job and queue layer.

use thiserror::Error;

use crate::core::JobId;

/// The main error type for queue operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The job record does not exist in the store
    #[error("job '{job_id}' not found")]
    JobNotFound { job_id: JobId },

    /// The job record exists but is missing its type
    #[error("job '{job_id}' was half-baked")]
    HalfBaked { job_id: JobId },

    /// A job id that could not be parsed as an integer
    #[error("invalid job id: {value}")]
    InvalidJobId { value: String },

    /// A persisted field that does not follow the record schema
    #[error("invalid job data: {message}")]
    InvalidJobData { message: String },

    /// An operation that needs a persisted job was called before `save`
    #[error("job has not been saved yet")]
    Unsaved,

    /// Backing store errors
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Serialization/deserialization errors
    #[error("serialization failed: {message}")]
    Serialization { message: String },

    /// A distributed lock could not be obtained within the allowed attempts
    #[error("unable to obtain lock '{key}'")]
    LockUnavailable { key: String },

    /// `shutdown` was requested while a full shutdown is already in progress
    #[error("already shutting down")]
    AlreadyShuttingDown,

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Errors reported by a job handler through its completion handle
    #[error("{message}")]
    Handler { message: String },
}

impl QueueError {
    /// Create a handler error from any displayable value
    pub fn handler(message: impl Into<String>) -> Self {
        QueueError::Handler {
            message: message.into(),
        }
    }

    /// Whether this error describes a missing or corrupt job record
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            QueueError::JobNotFound { .. } | QueueError::HalfBaked { .. }
        )
    }

    /// Whether the store itself failed, leaving the record untouched
    pub fn is_storage_error(&self) -> bool {
        matches!(self, QueueError::Storage { .. })
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization {
            message: err.to_string(),
        }
    }
}

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
