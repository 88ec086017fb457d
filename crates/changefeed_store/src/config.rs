//! Store configuration.

use changefeed_protocol::WireFormatVersion;

/// Configuration for the reference store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Number of partition ranges (`range-0` .. `range-{n-1}`).
    pub range_count: u32,
    /// Top-level document property holding the partition key.
    pub partition_key_path: String,
    /// Newest change feed wire format the store speaks.
    pub wire_format: WireFormatVersion,
    /// Upper bound on entries per page, whatever the client asks for.
    pub max_page_size: u32,
    /// Clock value (epoch seconds) stamped on the first write.
    pub start_time: u64,
}

impl StoreConfig {
    /// Creates a configuration with `range_count` ranges.
    pub fn new(range_count: u32) -> Self {
        Self {
            range_count: range_count.max(1),
            partition_key_path: "partitionKey".to_string(),
            wire_format: WireFormatVersion::new(2021, 9, 15),
            max_page_size: 1000,
            start_time: 1_700_000_000,
        }
    }

    /// Sets the partition key property.
    pub fn with_partition_key_path(mut self, path: impl Into<String>) -> Self {
        self.partition_key_path = path.into();
        self
    }

    /// Sets the newest supported wire format.
    ///
    /// A version older than `2021-09-15` makes the store answer enriched
    /// requests with bare documents.
    pub fn with_wire_format(mut self, version: WireFormatVersion) -> Self {
        self.wire_format = version;
        self
    }

    /// Sets the page size ceiling.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size.max(1);
        self
    }

    /// Sets the clock start.
    pub fn with_start_time(mut self, epoch_seconds: u64) -> Self {
        self.start_time = epoch_seconds;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(1)
    }
}
