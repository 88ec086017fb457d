//! Read request and response messages exchanged with a document store.

use crate::cursor::{ContinuationToken, Cursor, PartitionRangeId};
use crate::wire_format::{WireFormatVersion, WIRE_FORMAT_VERSION_HEADER};
use serde_json::Value;
use std::collections::BTreeMap;

/// A request for the next page of changes on one partition range.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadChangesRequest {
    /// Range to read.
    pub partition_range_id: PartitionRangeId,
    /// Position to read after.
    pub continuation: ContinuationToken,
    /// Maximum number of entries the caller wants back.
    pub page_size_hint: u32,
    /// Extra request headers, including wire format negotiation.
    pub headers: BTreeMap<String, String>,
}

impl ReadChangesRequest {
    /// Creates a request reading after `cursor`.
    pub fn new(cursor: &Cursor, page_size_hint: u32) -> Self {
        Self {
            partition_range_id: cursor.partition_range_id.clone(),
            continuation: cursor.continuation.clone(),
            page_size_hint,
            headers: BTreeMap::new(),
        }
    }

    /// Replaces the request headers.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Adds a single request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Looks up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns the requested wire format version, if the header is present
    /// and well formed.
    pub fn wire_format_version(&self) -> Option<WireFormatVersion> {
        self.header(WIRE_FORMAT_VERSION_HEADER)
            .and_then(|value| WireFormatVersion::parse(value).ok())
    }
}

/// A page of raw change entries, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    /// Raw entries as delivered by the store.
    pub entries: Vec<Value>,
    /// Continuation covering every entry in this page.
    pub continuation: String,
    /// Wire format the store actually used, if it reports one.
    pub wire_format_version: Option<WireFormatVersion>,
}

impl RawPage {
    /// Creates a page.
    pub fn new(entries: Vec<Value>, continuation: impl Into<String>) -> Self {
        Self {
            entries,
            continuation: continuation.into(),
            wire_format_version: None,
        }
    }

    /// Records the wire format the store used.
    pub fn with_wire_format(mut self, version: WireFormatVersion) -> Self {
        self.wire_format_version = Some(version);
        self
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the page carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Store answer to a [`ReadChangesRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadChangesResponse {
    /// New changes are available.
    Page(RawPage),
    /// Nothing changed since the requested continuation.
    NotModified {
        /// Continuation echoed by the store.
        continuation: ContinuationToken,
    },
}

impl ReadChangesResponse {
    /// Returns true for a not-modified answer.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, ReadChangesResponse::NotModified { .. })
    }
}
