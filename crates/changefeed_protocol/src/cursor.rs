//! Resumable positions within a partition range's change stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a disjoint keyspace shard with its own change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionRangeId(String);

impl PartitionRangeId {
    /// Creates a partition range id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionRangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionRangeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PartitionRangeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque continuation issued by the store.
///
/// `Beginning` is the sentinel for "nothing consumed yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContinuationToken {
    /// Start of the retained change stream.
    Beginning,
    /// Store-issued token, never interpreted by the consumer.
    Token(String),
}

impl ContinuationToken {
    /// Wraps a store-issued token.
    pub fn token(value: impl Into<String>) -> Self {
        Self::Token(value.into())
    }

    /// Returns true for the beginning sentinel.
    pub fn is_beginning(&self) -> bool {
        matches!(self, ContinuationToken::Beginning)
    }

    /// Returns the raw token, if any.
    pub fn as_token(&self) -> Option<&str> {
        match self {
            ContinuationToken::Beginning => None,
            ContinuationToken::Token(token) => Some(token),
        }
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuationToken::Beginning => f.write_str("<beginning>"),
            ContinuationToken::Token(token) => f.write_str(token),
        }
    }
}

/// "All changes consumed up to here" for one partition range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Partition range this cursor belongs to.
    pub partition_range_id: PartitionRangeId,
    /// Position within the range.
    pub continuation: ContinuationToken,
}

impl Cursor {
    /// Creates a cursor at an explicit position.
    pub fn new(partition_range_id: PartitionRangeId, continuation: ContinuationToken) -> Self {
        Self {
            partition_range_id,
            continuation,
        }
    }

    /// Creates the beginning cursor for a range.
    pub fn beginning(partition_range_id: PartitionRangeId) -> Self {
        Self::new(partition_range_id, ContinuationToken::Beginning)
    }

    /// Returns true if nothing has been consumed on this range.
    pub fn is_beginning(&self) -> bool {
        self.continuation.is_beginning()
    }

    /// Returns a new cursor on the same range at `continuation`.
    pub fn advanced_to(&self, continuation: ContinuationToken) -> Self {
        Self::new(self.partition_range_id.clone(), continuation)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition_range_id, self.continuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beginning_cursor() {
        let cursor = Cursor::beginning("range-0".into());
        assert!(cursor.is_beginning());
        assert_eq!(cursor.continuation.as_token(), None);
        assert_eq!(cursor.to_string(), "range-0@<beginning>");
    }

    #[test]
    fn advance_keeps_range() {
        let cursor = Cursor::beginning("range-1".into());
        let next = cursor.advanced_to(ContinuationToken::token("17"));

        assert_eq!(next.partition_range_id, cursor.partition_range_id);
        assert_eq!(next.continuation.as_token(), Some("17"));
        assert!(!next.is_beginning());
        // The original is untouched.
        assert!(cursor.is_beginning());
    }

    #[test]
    fn json_shape() {
        let cursor = Cursor::new("r".into(), ContinuationToken::token("42"));
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "partition_range_id": "r",
                "continuation": { "kind": "token", "value": "42" }
            })
        );

        let beginning = serde_json::to_value(Cursor::beginning("r".into())).unwrap();
        assert_eq!(beginning["continuation"], serde_json::json!({ "kind": "beginning" }));
    }
}
