//! # Change Feed Protocol
//!
//! Wire types shared by the change feed consumer and document stores.
//!
//! This crate provides:
//! - `Cursor` and `ContinuationToken` for resumable positions
//! - `ChangeEnvelope` with replication metadata (LSN, CRTS, `_ts`)
//! - Read request/response messages
//! - Wire format version negotiation
//! - Decoding of raw change entries into typed envelopes
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod envelope;
mod error;
mod messages;
mod wire_format;

pub use cursor::{ContinuationToken, Cursor, PartitionRangeId};
pub use envelope::{decode_entry, decode_page, ChangeEnvelope, ChangeMetadata, DecodedPage};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{RawPage, ReadChangesRequest, ReadChangesResponse};
pub use wire_format::{
    DeliveryMode, DowngradePolicy, WireFormatVersion, METADATA_WIRE_FORMAT,
    WIRE_FORMAT_VERSION_HEADER,
};
