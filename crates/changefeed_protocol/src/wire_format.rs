//! Wire format negotiation.
//!
//! A store only wraps each change in a `{ current, metadata }` envelope when
//! the request carries the wire format version header. Older or absent
//! versions produce bare documents.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Request header that selects the change feed wire format.
pub const WIRE_FORMAT_VERSION_HEADER: &str = "x-ms-cosmos-changefeed-wire-format-version";

/// First wire format version that carries `lsn`/`crts` metadata.
pub const METADATA_WIRE_FORMAT: WireFormatVersion = WireFormatVersion::new(2021, 9, 15);

/// A date-stamped wire format version (`YYYY-MM-DD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireFormatVersion {
    year: u16,
    month: u8,
    day: u8,
}

impl WireFormatVersion {
    /// Creates a version from its date parts.
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    /// Parses a `YYYY-MM-DD` version string.
    pub fn parse(value: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidWireFormatVersion(value.to_string());

        let mut parts = value.trim().splitn(3, '-');
        let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if year.len() != 4 || month.len() != 2 || day.len() != 2 {
            return Err(invalid());
        }

        let year: u16 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        let day: u8 = day.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(invalid());
        }

        Ok(Self::new(year, month, day))
    }

    /// Returns true if this version wraps changes with metadata.
    pub fn supports_metadata(&self) -> bool {
        *self >= METADATA_WIRE_FORMAT
    }
}

impl fmt::Display for WireFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for WireFormatVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Whether changes are delivered with replication metadata.
///
/// Selected once when a stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Document plus `lsn`, `crts` and operation timestamp.
    #[default]
    Enriched,
    /// Bare documents only.
    Plain,
}

impl DeliveryMode {
    /// Returns the request headers for this mode merged over `extra`.
    ///
    /// The wire format header always wins over a caller-supplied value in
    /// enriched mode.
    pub fn request_headers(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut headers = extra.clone();
        if *self == DeliveryMode::Enriched {
            headers.insert(
                WIRE_FORMAT_VERSION_HEADER.to_string(),
                METADATA_WIRE_FORMAT.to_string(),
            );
        }
        headers
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Enriched => f.write_str("enriched"),
            DeliveryMode::Plain => f.write_str("plain"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enriched" | "metadata" => Ok(DeliveryMode::Enriched),
            "plain" => Ok(DeliveryMode::Plain),
            _ => Err(ProtocolError::UnknownDeliveryMode(s.to_string())),
        }
    }
}

/// What to do when enriched delivery was requested but the store
/// answered without metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DowngradePolicy {
    /// Reject the page with a protocol error.
    #[default]
    Fail,
    /// Deliver bare documents as `Plain` envelopes.
    Degrade,
}

impl fmt::Display for DowngradePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowngradePolicy::Fail => f.write_str("fail"),
            DowngradePolicy::Degrade => f.write_str("degrade"),
        }
    }
}

impl FromStr for DowngradePolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(DowngradePolicy::Fail),
            "degrade" => Ok(DowngradePolicy::Degrade),
            _ => Err(ProtocolError::UnknownDowngradePolicy(s.to_string())),
        }
    }
}
