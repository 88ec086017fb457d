//! Error types for the reference store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the write side of the reference store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The document is not a JSON object with the required keys.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A document with this id already exists in its partition.
    #[error("document {id} already exists in partition {partition_key}")]
    AlreadyExists {
        /// Document id.
        id: String,
        /// Partition key value.
        partition_key: String,
    },

    /// The range is not served by this store.
    #[error("unknown partition range: {0}")]
    UnknownRange(String),

    /// A log position outside the retained log was requested.
    #[error("lsn {lsn} is beyond the end of range {range} (next lsn {next})")]
    LsnOutOfRange {
        /// Range.
        range: String,
        /// Requested position.
        lsn: u64,
        /// Next LSN to be assigned.
        next: u64,
    },

    /// The document could not be converted to JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if the caller supplied bad input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidDocument(_)
                | StoreError::AlreadyExists { .. }
                | StoreError::Serialization(_)
        )
    }
}
