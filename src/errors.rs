//! Backend-neutral error taxonomy.
//!
//! Adapters translate provider failures into these variants; the retry
//! executor only intercepts [`StoreError::Transient`], and the pointer
//! manager only intercepts precondition and lease conflicts.  Every
//! variant carries enough context (target, key, operation) to be logged
//! without reconstruction.

use std::time::Duration;
use thiserror::Error;

use crate::config::BackendType;
use crate::storage::backend::ObjectMeta;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    LeaseConflict,
    ConcurrentModification,
    Transient,
    RetriesExhausted,
    DeadlineExceeded,
    Cancelled,
    Config,
    Condition,
    Backend,
}

impl ErrorKind {
    /// Short label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::LeaseConflict => "lease_conflict",
            ErrorKind::ConcurrentModification => "concurrent_modification",
            ErrorKind::Transient => "transient",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Condition => "condition",
            ErrorKind::Backend => "backend",
        }
    }
}

/// Errors surfaced by targets, adapters and the pointer manager.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist.
    #[error("object not found: {key} (target {target})")]
    NotFound { target: String, key: String },

    /// A conditional write lost a race.
    #[error("precondition failed for {key} (target {target})")]
    PreconditionFailed { target: String, key: String },

    /// Another holder owns the lease on the object.
    #[error("lease conflict on {key} (target {target}): {message}")]
    LeaseConflict {
        target: String,
        key: String,
        message: String,
    },

    /// An ACTIVE pointer update lost to a concurrent writer. `current` holds
    /// the winning version when it was re-read.
    #[error("concurrent modification of {key}: {message}")]
    ConcurrentModification {
        key: String,
        message: String,
        current: Option<ObjectMeta>,
    },

    /// Timeout, throttling or server-side failure. Retried by the executor.
    #[error("transient {operation} failure on {key} (target {target}): {message}")]
    Transient {
        target: String,
        key: String,
        operation: &'static str,
        message: String,
    },

    /// Transient failures persisted beyond the retry budget.
    #[error("{operation} on target {target} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        target: String,
        operation: &'static str,
        attempts: u32,
        source: Box<StoreError>,
    },

    /// The overall deadline elapsed before the operation completed.
    #[error("{operation} on target {target} exceeded its {timeout:?} deadline")]
    DeadlineExceeded {
        target: String,
        operation: &'static str,
        timeout: Duration,
        #[source]
        last_error: Option<Box<StoreError>>,
    },

    /// The caller cancelled the operation.
    #[error("{operation} on target {target} was cancelled")]
    Cancelled {
        target: String,
        operation: &'static str,
    },

    /// Invalid or incomplete configuration. Only raised at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend has no native primitive for this condition.
    #[error("{condition} preconditions are not supported by the {backend} backend")]
    UnsupportedCondition {
        backend: BackendType,
        condition: String,
    },

    /// The condition is malformed (e.g. a negative generation).
    #[error("invalid write condition: {0}")]
    InvalidCondition(String),

    /// No version token is available to build a precondition from.
    #[error("no version token available for {key}; cannot build a precondition")]
    PreconditionUnavailable { key: String },

    /// Non-retryable provider failure passed through unmodified.
    #[error("{operation} on {key} (target {target}) failed: {message}")]
    Backend {
        target: String,
        key: String,
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            StoreError::LeaseConflict { .. } => ErrorKind::LeaseConflict,
            StoreError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            StoreError::Transient { .. } => ErrorKind::Transient,
            StoreError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            StoreError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            StoreError::Cancelled { .. } => ErrorKind::Cancelled,
            StoreError::Config(_) => ErrorKind::Config,
            StoreError::UnsupportedCondition { .. }
            | StoreError::InvalidCondition(_)
            | StoreError::PreconditionUnavailable { .. } => ErrorKind::Condition,
            StoreError::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// Whether the retry executor may retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    /// Whether this is a semantic conflict (lost race or held lease).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::PreconditionFailed { .. }
                | StoreError::LeaseConflict { .. }
                | StoreError::ConcurrentModification { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// The key this error refers to, when it refers to one.
    pub fn key(&self) -> Option<&str> {
        match self {
            StoreError::NotFound { key, .. }
            | StoreError::PreconditionFailed { key, .. }
            | StoreError::LeaseConflict { key, .. }
            | StoreError::ConcurrentModification { key, .. }
            | StoreError::Transient { key, .. }
            | StoreError::PreconditionUnavailable { key }
            | StoreError::Backend { key, .. } => Some(key),
            StoreError::RetriesExhausted { source, .. } => source.key(),
            StoreError::DeadlineExceeded { last_error, .. } => {
                last_error.as_ref().and_then(|e| e.key())
            }
            _ => None,
        }
    }
}
