//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting change feed wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The document body could not be decoded into the requested type.
    #[error("entry {index}: failed to decode document: {reason}")]
    Decode {
        /// Position of the entry within its page.
        index: usize,
        /// Decoder message.
        reason: String,
    },

    /// An enriched entry is missing a required metadata field.
    #[error("entry {index}: missing metadata field `{field}`")]
    MissingField {
        /// Position of the entry within its page.
        index: usize,
        /// Wire name of the missing field.
        field: &'static str,
    },

    /// Metadata was requested but the store returned a bare document.
    #[error("entry {index}: metadata requested but store returned a bare document")]
    MetadataMissing {
        /// Position of the entry within its page.
        index: usize,
    },

    /// The store answered with an older wire format than requested.
    #[error("wire format negotiated down: requested {requested}, got {negotiated}")]
    WireFormatDowngraded {
        /// Version sent in the request header.
        requested: String,
        /// Version reported by the store.
        negotiated: String,
    },

    /// A page carried entries but its continuation equals the request's.
    #[error("continuation did not advance past {continuation}")]
    CursorNotAdvanced {
        /// The repeated continuation token.
        continuation: String,
    },

    /// Malformed wire format version string.
    #[error("invalid wire format version: {0}")]
    InvalidWireFormatVersion(String),

    /// Unknown delivery mode name.
    #[error("unknown delivery mode: {0} (expected `enriched` or `plain`)")]
    UnknownDeliveryMode(String),

    /// Unknown downgrade policy name.
    #[error("unknown downgrade policy: {0} (expected `fail` or `degrade`)")]
    UnknownDowngradePolicy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::MissingField {
            index: 3,
            field: "lsn",
        };
        assert_eq!(err.to_string(), "entry 3: missing metadata field `lsn`");

        let err = ProtocolError::WireFormatDowngraded {
            requested: "2021-09-15".into(),
            negotiated: "2020-01-01".into(),
        };
        assert!(err.to_string().contains("2021-09-15"));
        assert!(err.to_string().contains("2020-01-01"));
    }
}
