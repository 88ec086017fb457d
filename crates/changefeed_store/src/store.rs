//! Partitioned in-memory document store with a change feed.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::log::{LogEntry, OperationKind, PartitionLog, ReadPosition};
use changefeed_engine::{ChangeFeedSource, SourceError};
use changefeed_protocol::{
    ContinuationToken, PartitionRangeId, RawPage, ReadChangesRequest, ReadChangesResponse,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::{ready, Future};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Range the document lives in.
    pub partition_range_id: PartitionRangeId,
    /// LSN assigned to the write.
    pub lsn: u64,
    /// Timestamp stamped into `_ts`.
    pub timestamp: u64,
    /// Whether the write created or replaced the document.
    pub operation: OperationKind,
}

struct Range {
    id: PartitionRangeId,
    log: RwLock<PartitionLog>,
}

/// A document store serving a latest-version change feed per range.
///
/// Documents are routed to a range by hashing their partition key. Each
/// write gets the next LSN of its range and a timestamp from a logical clock
/// that advances one second per write.
pub struct MemoryDocumentStore {
    config: StoreConfig,
    ranges: Vec<Range>,
    clock: AtomicU64,
    faults: Mutex<VecDeque<SourceError>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig) -> Self {
        let ranges = (0..config.range_count)
            .map(|i| Range {
                id: PartitionRangeId::new(format!("range-{i}")),
                log: RwLock::new(PartitionLog::new()),
            })
            .collect();
        Self {
            clock: AtomicU64::new(config.start_time),
            config,
            ranges,
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns every range id in order.
    pub fn range_ids(&self) -> Vec<PartitionRangeId> {
        self.ranges.iter().map(|range| range.id.clone()).collect()
    }

    /// Returns the range a partition key maps to.
    pub fn range_for(&self, partition_key: &str) -> PartitionRangeId {
        self.ranges[self.range_index(partition_key)].id.clone()
    }

    /// Creates a document; fails if it already exists.
    pub fn create(&self, document: Value) -> StoreResult<WriteReceipt> {
        self.write(document, false)
    }

    /// Creates or replaces a document.
    pub fn upsert(&self, document: Value) -> StoreResult<WriteReceipt> {
        self.write(document, true)
    }

    /// Serializes and upserts an item.
    pub fn upsert_item<T: Serialize>(&self, item: &T) -> StoreResult<WriteReceipt> {
        self.upsert(serde_json::to_value(item)?)
    }

    /// Reads the latest version of a document.
    pub fn read_item(&self, id: &str, partition_key: &str) -> Option<Value> {
        let range = &self.ranges[self.range_index(partition_key)];
        let log = range.log.read();
        log.get(id).map(|entry| entry.document.clone())
    }

    /// Returns the number of documents retained in a range's feed.
    pub fn feed_len(&self, partition_range_id: &PartitionRangeId) -> StoreResult<usize> {
        Ok(self.range(partition_range_id)?.log.read().len())
    }

    /// Returns the LSN of the most recent write to a range.
    pub fn latest_lsn(&self, partition_range_id: &PartitionRangeId) -> StoreResult<u64> {
        Ok(self.range(partition_range_id)?.log.read().next_lsn() - 1)
    }

    /// Drops changes below `lsn` from a range's feed.
    ///
    /// Readers resuming from before `lsn` get a gone error.
    pub fn truncate_before(
        &self,
        partition_range_id: &PartitionRangeId,
        lsn: u64,
    ) -> StoreResult<usize> {
        let range = self.range(partition_range_id)?;
        let mut log = range.log.write();
        if lsn > log.next_lsn() {
            return Err(StoreError::LsnOutOfRange {
                range: partition_range_id.to_string(),
                lsn,
                next: log.next_lsn(),
            });
        }
        let dropped = log.truncate_before(lsn);
        info!(range = %partition_range_id, lsn, dropped, "truncated change feed");
        Ok(dropped)
    }

    /// Makes the next read fail with `error`. Faults queue up in order.
    pub fn inject_fault(&self, error: SourceError) {
        self.faults.lock().push_back(error);
    }

    /// Serves one read of the change feed.
    pub fn read_page(
        &self,
        request: &ReadChangesRequest,
    ) -> Result<ReadChangesResponse, SourceError> {
        if let Some(fault) = self.faults.lock().pop_front() {
            debug!(range = %request.partition_range_id, %fault, "injected fault");
            return Err(fault);
        }

        let range = self
            .range(&request.partition_range_id)
            .map_err(|_| SourceError::PartitionNotFound(request.partition_range_id.to_string()))?;
        let log = range.log.read();

        let requested = match &request.continuation {
            ContinuationToken::Beginning => None,
            ContinuationToken::Token(token) => Some(token.parse::<u64>().map_err(|_| {
                SourceError::BadRequest(format!("malformed continuation {token:?}"))
            })?),
        };
        let after = match log.position(requested) {
            ReadPosition::After(lsn) => lsn,
            ReadPosition::Gone => {
                return Err(SourceError::Gone {
                    reason: format!(
                        "continuation {} precedes retained log start {}",
                        request.continuation,
                        log.floor()
                    ),
                })
            }
            ReadPosition::Ahead => {
                return Err(SourceError::BadRequest(format!(
                    "continuation {} is ahead of the log (latest lsn {}); if the store was \
                     re-created, restart the range with `changefeed reset`",
                    request.continuation,
                    log.next_lsn() - 1
                )))
            }
        };

        let limit = match request.page_size_hint {
            0 => self.config.max_page_size,
            hint => hint.min(self.config.max_page_size),
        };
        let entries = log.entries_after(after, limit as usize);
        let Some(last) = entries.last() else {
            return Ok(ReadChangesResponse::NotModified {
                continuation: request.continuation.clone(),
            });
        };

        // The store answers with the older of the requested and supported
        // versions; without the header it never wraps.
        let negotiated = request
            .wire_format_version()
            .map(|requested| requested.min(self.config.wire_format));
        let enriched = negotiated.is_some_and(|version| version.supports_metadata());

        let raw = entries
            .iter()
            .map(|entry| {
                if enriched {
                    enriched_entry(entry)
                } else {
                    entry.document.clone()
                }
            })
            .collect();
        let mut page = RawPage::new(raw, last.lsn.to_string());
        if let Some(version) = negotiated {
            page = page.with_wire_format(version);
        }

        debug!(
            range = %request.partition_range_id,
            after,
            count = page.len(),
            enriched,
            "served change feed page"
        );
        Ok(ReadChangesResponse::Page(page))
    }

    fn write(&self, mut document: Value, replace: bool) -> StoreResult<WriteReceipt> {
        let (id, partition_key) = self.document_keys(&document)?;
        let range = &self.ranges[self.range_index(&partition_key)];
        let mut log = range.log.write();

        let operation = if log.contains(&id) {
            if !replace {
                return Err(StoreError::AlreadyExists { id, partition_key });
            }
            OperationKind::Replace
        } else {
            OperationKind::Create
        };

        let timestamp = self.clock.fetch_add(1, Ordering::SeqCst);
        let entry = log.append(id, operation, timestamp, |lsn| {
            if let Some(object) = document.as_object_mut() {
                object.insert("_ts".to_string(), json!(timestamp));
                object.insert("_lsn".to_string(), json!(lsn));
            }
            document
        });

        debug!(
            range = %range.id,
            id = %entry.id,
            lsn = entry.lsn,
            operation = entry.operation.as_str(),
            "wrote document"
        );
        Ok(WriteReceipt {
            partition_range_id: range.id.clone(),
            lsn: entry.lsn,
            timestamp,
            operation,
        })
    }

    fn document_keys(&self, document: &Value) -> StoreResult<(String, String)> {
        let object = document
            .as_object()
            .ok_or_else(|| StoreError::InvalidDocument("document is not an object".into()))?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::InvalidDocument("missing string \"id\"".into()))?;
        let path = &self.config.partition_key_path;
        let partition_key = object.get(path).and_then(Value::as_str).ok_or_else(|| {
            StoreError::InvalidDocument(format!("missing string partition key {path:?}"))
        })?;
        Ok((id.to_string(), partition_key.to_string()))
    }

    fn range(&self, partition_range_id: &PartitionRangeId) -> StoreResult<&Range> {
        self.ranges
            .iter()
            .find(|range| range.id == *partition_range_id)
            .ok_or_else(|| StoreError::UnknownRange(partition_range_id.to_string()))
    }

    fn range_index(&self, partition_key: &str) -> usize {
        (fnv1a(partition_key.as_bytes()) % self.ranges.len() as u64) as usize
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl ChangeFeedSource for MemoryDocumentStore {
    fn read_changes(
        &self,
        request: &ReadChangesRequest,
    ) -> impl Future<Output = Result<ReadChangesResponse, SourceError>> + Send {
        ready(self.read_page(request))
    }
}

fn enriched_entry(entry: &LogEntry) -> Value {
    json!({
        "current": entry.document,
        "metadata": {
            "lsn": entry.lsn,
            "crts": entry.crts,
            "operationType": entry.operation.as_str(),
        }
    })
}

/// Stable 64-bit FNV-1a, so routing does not change between runs.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}
