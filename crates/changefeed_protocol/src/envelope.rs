//! Change envelopes and raw entry decoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::RawPage;
use crate::wire_format::{DeliveryMode, DowngradePolicy, METADATA_WIRE_FORMAT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Replication metadata attached to an enriched change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMetadata {
    /// Log sequence number of the change within its range.
    pub lsn: String,
    /// Conflict-resolution timestamp (`crts`).
    pub conflict_resolved_timestamp: String,
    /// Document timestamp (`_ts`).
    ///
    /// Falls back to `crts` when the document has no `_ts`.
    pub operation_timestamp: String,
    /// Operation kind reported by the store (`create`, `replace`, ...).
    pub operation_type: Option<String>,
}

impl ChangeMetadata {
    /// Parses the LSN as an ordinal, if it is numeric.
    pub fn lsn_value(&self) -> Option<u64> {
        self.lsn.parse().ok()
    }

    fn from_wire(index: usize, metadata: &Value, current: &Value) -> ProtocolResult<Self> {
        let lsn = wire_scalar(metadata.get("lsn"))
            .ok_or(ProtocolError::MissingField { index, field: "lsn" })?;
        let crts = wire_scalar(metadata.get("crts"))
            .ok_or(ProtocolError::MissingField { index, field: "crts" })?;
        let operation_timestamp = wire_scalar(current.get("_ts")).unwrap_or_else(|| crts.clone());
        let operation_type = metadata
            .get("operationType")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            lsn,
            conflict_resolved_timestamp: crts,
            operation_timestamp,
            operation_type,
        })
    }
}

/// One changed document as delivered to a handler.
///
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEnvelope<T> {
    /// Document with replication metadata.
    Enriched {
        /// Current version of the document.
        document: T,
        /// Replication metadata.
        metadata: ChangeMetadata,
    },
    /// Bare document.
    Plain {
        /// Current version of the document.
        document: T,
    },
}

impl<T> ChangeEnvelope<T> {
    /// Returns the document.
    pub fn document(&self) -> &T {
        match self {
            ChangeEnvelope::Enriched { document, .. } | ChangeEnvelope::Plain { document } => {
                document
            }
        }
    }

    /// Consumes the envelope, returning the document.
    pub fn into_document(self) -> T {
        match self {
            ChangeEnvelope::Enriched { document, .. } | ChangeEnvelope::Plain { document } => {
                document
            }
        }
    }

    /// Returns the metadata of an enriched envelope.
    pub fn metadata(&self) -> Option<&ChangeMetadata> {
        match self {
            ChangeEnvelope::Enriched { metadata, .. } => Some(metadata),
            ChangeEnvelope::Plain { .. } => None,
        }
    }

    /// Returns the LSN of an enriched envelope.
    pub fn lsn(&self) -> Option<&str> {
        self.metadata().map(|metadata| metadata.lsn.as_str())
    }

    /// Returns true if the envelope carries metadata.
    pub fn is_enriched(&self) -> bool {
        matches!(self, ChangeEnvelope::Enriched { .. })
    }

    /// Maps the document, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ChangeEnvelope<U> {
        match self {
            ChangeEnvelope::Enriched { document, metadata } => ChangeEnvelope::Enriched {
                document: f(document),
                metadata,
            },
            ChangeEnvelope::Plain { document } => ChangeEnvelope::Plain {
                document: f(document),
            },
        }
    }
}

/// Decoded contents of a [`RawPage`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPage<T> {
    /// Envelopes in page order.
    pub envelopes: Vec<ChangeEnvelope<T>>,
    /// Entries delivered as `Plain` although enriched delivery was requested.
    pub degraded: usize,
}

/// Decodes every entry of a page, preserving order.
///
/// Fails on the first entry that cannot be decoded.
pub fn decode_page<T: DeserializeOwned>(
    page: &RawPage,
    mode: DeliveryMode,
    policy: DowngradePolicy,
) -> ProtocolResult<DecodedPage<T>> {
    if mode == DeliveryMode::Enriched && policy == DowngradePolicy::Fail {
        if let Some(version) = page.wire_format_version {
            if !version.supports_metadata() {
                return Err(ProtocolError::WireFormatDowngraded {
                    requested: METADATA_WIRE_FORMAT.to_string(),
                    negotiated: version.to_string(),
                });
            }
        }
    }

    let mut envelopes = Vec::with_capacity(page.len());
    let mut degraded = 0;
    for (index, entry) in page.entries.iter().enumerate() {
        let envelope = decode_entry(index, entry, mode, policy)?;
        if mode == DeliveryMode::Enriched && !envelope.is_enriched() {
            degraded += 1;
        }
        envelopes.push(envelope);
    }

    Ok(DecodedPage {
        envelopes,
        degraded,
    })
}

/// Decodes a single raw entry at `index` of its page.
pub fn decode_entry<T: DeserializeOwned>(
    index: usize,
    entry: &Value,
    mode: DeliveryMode,
    policy: DowngradePolicy,
) -> ProtocolResult<ChangeEnvelope<T>> {
    match (mode, split_wrapped(entry)) {
        (DeliveryMode::Enriched, Some((current, metadata))) => {
            let metadata = ChangeMetadata::from_wire(index, metadata, current)?;
            Ok(ChangeEnvelope::Enriched {
                document: decode_document(index, current)?,
                metadata,
            })
        }
        (DeliveryMode::Enriched, None) => match policy {
            DowngradePolicy::Fail => Err(ProtocolError::MetadataMissing { index }),
            DowngradePolicy::Degrade => Ok(ChangeEnvelope::Plain {
                document: decode_document(index, entry)?,
            }),
        },
        (DeliveryMode::Plain, Some((current, _))) => Ok(ChangeEnvelope::Plain {
            document: decode_document(index, current)?,
        }),
        (DeliveryMode::Plain, None) => Ok(ChangeEnvelope::Plain {
            document: decode_document(index, entry)?,
        }),
    }
}

/// Splits a `{ current, metadata }` entry.
fn split_wrapped(entry: &Value) -> Option<(&Value, &Value)> {
    let object = entry.as_object()?;
    let current = object.get("current")?;
    let metadata = object.get("metadata")?;
    metadata.is_object().then_some((current, metadata))
}

fn decode_document<T: DeserializeOwned>(index: usize, value: &Value) -> ProtocolResult<T> {
    T::deserialize(value).map_err(|e| ProtocolError::Decode {
        index,
        reason: e.to_string(),
    })
}

/// Metadata fields arrive as numbers or strings depending on the store.
fn wire_scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
