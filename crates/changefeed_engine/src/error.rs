//! Error types for the consumer engine.

use changefeed_protocol::{Cursor, PartitionRangeId, ProtocolError};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Errors reported by a document store's change feed endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Request rate too high.
    #[error("throttled by store")]
    Throttled {
        /// Delay suggested by the store.
        retry_after: Option<Duration>,
    },

    /// Network failure or store temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("store request timed out")]
    Timeout,

    /// The continuation is no longer valid (log truncated past it).
    #[error("continuation gone: {reason}")]
    Gone {
        /// Store explanation.
        reason: String,
    },

    /// The partition range does not exist.
    #[error("partition range not found: {0}")]
    PartitionNotFound(String),

    /// The request was rejected as malformed or unauthorised.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl SourceError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Throttled { .. } | SourceError::Unavailable(_) | SourceError::Timeout
        )
    }

    /// Returns the store's retry hint.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Cursor persistence failures.
#[derive(Error, Debug)]
pub enum PersistError {
    /// Underlying I/O failure.
    #[error("cursor store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cursor could not be serialized.
    #[error("cursor serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted cursor could not be read back.
    #[error("corrupt cursor file {path}: {reason}")]
    Corrupt {
        /// File that failed to parse.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },
}

/// Failure reported by a change handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A handler failed partway through a batch.
///
/// Entries `0..succeeded` were handled, entry `failed_index` failed, and the
/// remaining `not_attempted` entries were never invoked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failed on entry {failed_index} of range {partition_range_id}: {source}")]
pub struct DispatchError {
    /// Range the batch belongs to.
    pub partition_range_id: PartitionRangeId,
    /// Number of entries handled successfully before the failure.
    pub succeeded: usize,
    /// Index of the failing entry.
    pub failed_index: usize,
    /// Entries after the failing one.
    pub not_attempted: usize,
    /// Handler failure.
    #[source]
    pub source: HandlerError,
}

impl DispatchError {
    /// Indices of the entries that were handled.
    pub fn succeeded_indices(&self) -> Range<usize> {
        0..self.succeeded
    }
}

/// A configuration value outside its allowed range.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    /// Offending setting.
    pub field: &'static str,
    /// What is wrong with it.
    pub reason: String,
}

impl ConfigError {
    /// Creates a configuration error.
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while consuming a change feed.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Transient failure; retry with the same cursor after a delay.
    #[error("retryable feed error: {reason}")]
    Retryable {
        /// What went wrong.
        reason: String,
        /// Delay suggested by the store.
        retry_after: Option<Duration>,
    },

    /// The cursor is no longer valid; the range must restart from the
    /// beginning and changes may have been missed.
    #[error("cursor expired for partition range {partition_range_id}: {reason}")]
    CursorExpired {
        /// Affected range.
        partition_range_id: PartitionRangeId,
        /// The rejected cursor.
        cursor: Cursor,
        /// Store explanation.
        reason: String,
    },

    /// Cursor save failed; the batch is not consumed.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Handler failed; the batch will be redelivered.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Change entries could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Permanent store failure other than cursor expiry.
    #[error("source error: {0}")]
    Source(SourceError),

    /// The loop was started with an invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Consumption was cancelled.
    #[error("consumption cancelled")]
    Cancelled,
}

impl FeedError {
    /// Creates a retryable error.
    pub fn retryable(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Retryable {
            reason: reason.into(),
            retry_after,
        }
    }

    /// Classifies a store error raised while reading at `cursor`.
    pub fn from_source(error: SourceError, cursor: &Cursor) -> Self {
        match error {
            SourceError::Gone { reason } => Self::CursorExpired {
                partition_range_id: cursor.partition_range_id.clone(),
                cursor: cursor.clone(),
                reason,
            },
            e if e.is_transient() => Self::Retryable {
                reason: e.to_string(),
                retry_after: e.retry_after(),
            },
            e => Self::Source(e),
        }
    }

    /// Returns true if this error can be retried with the same cursor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Retryable { .. } | FeedError::Dispatch(_))
    }

    /// Returns the store's retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FeedError::Retryable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
