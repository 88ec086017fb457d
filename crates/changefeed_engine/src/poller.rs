//! Feed poller: one read against one partition range.

use crate::error::{FeedError, FeedResult};
use crate::source::ChangeFeedSource;
use changefeed_protocol::{
    decode_page, ChangeEnvelope, ContinuationToken, Cursor, DeliveryMode, DowngradePolicy,
    ProtocolError, ReadChangesRequest, ReadChangesResponse,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a successful poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult<T> {
    /// Nothing new since the cursor.
    NoChanges,
    /// Changes oldest first, and the cursor covering all of them.
    Batch {
        /// Decoded changes in store order.
        changes: Vec<ChangeEnvelope<T>>,
        /// Cursor to commit once every change was handled.
        next_cursor: Cursor,
    },
}

impl<T> PollResult<T> {
    /// Returns the number of changes carried.
    pub fn len(&self) -> usize {
        match self {
            PollResult::NoChanges => 0,
            PollResult::Batch { changes, .. } => changes.len(),
        }
    }

    /// Returns true for `NoChanges`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Issues read requests and interprets the store's answers.
///
/// The poller never mutates cursor state; it only computes the next cursor.
pub struct FeedPoller<S, T> {
    source: S,
    mode: DeliveryMode,
    downgrade: DowngradePolicy,
    extra_headers: BTreeMap<String, String>,
    degrade_reported: AtomicBool,
    _document: PhantomData<fn() -> T>,
}

impl<S: ChangeFeedSource, T: DeserializeOwned> FeedPoller<S, T> {
    /// Creates a poller for the given delivery mode.
    pub fn new(source: S, mode: DeliveryMode) -> Self {
        Self {
            source,
            mode,
            downgrade: DowngradePolicy::default(),
            extra_headers: BTreeMap::new(),
            degrade_reported: AtomicBool::new(false),
            _document: PhantomData,
        }
    }

    /// Sets the reaction to a store that drops metadata.
    pub fn with_downgrade_policy(mut self, policy: DowngradePolicy) -> Self {
        self.downgrade = policy;
        self
    }

    /// Sets headers sent with every read.
    pub fn with_extra_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.extra_headers = headers;
        self
    }

    /// Builds the request for reading after `cursor`.
    pub fn request_for(&self, cursor: &Cursor, page_size_hint: u32) -> ReadChangesRequest {
        ReadChangesRequest::new(cursor, page_size_hint)
            .with_headers(self.mode.request_headers(&self.extra_headers))
    }

    /// Reads the next page after `cursor`.
    ///
    /// Exceeding `deadline` is reported as a retryable error, as is any
    /// transient store failure. The caller retries with the same cursor.
    pub async fn poll(
        &self,
        cursor: &Cursor,
        page_size_hint: u32,
        deadline: Duration,
    ) -> FeedResult<PollResult<T>> {
        let request = self.request_for(cursor, page_size_hint);
        debug!(
            range = %cursor.partition_range_id,
            continuation = %cursor.continuation,
            page_size_hint,
            "reading changes"
        );

        let response = match tokio::time::timeout(deadline, self.source.read_changes(&request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(FeedError::from_source(e, cursor)),
            Err(_) => {
                return Err(FeedError::retryable(
                    format!("poll deadline of {deadline:?} exceeded"),
                    None,
                ))
            }
        };

        let page = match response {
            ReadChangesResponse::NotModified { .. } => return Ok(PollResult::NoChanges),
            ReadChangesResponse::Page(page) if page.is_empty() => {
                return Ok(PollResult::NoChanges)
            }
            ReadChangesResponse::Page(page) => page,
        };

        let next = ContinuationToken::token(page.continuation.clone());
        if next == cursor.continuation {
            return Err(ProtocolError::CursorNotAdvanced {
                continuation: page.continuation,
            }
            .into());
        }

        let decoded = decode_page::<T>(&page, self.mode, self.downgrade)?;
        if decoded.degraded > 0 && !self.degrade_reported.swap(true, Ordering::Relaxed) {
            warn!(
                range = %cursor.partition_range_id,
                degraded = decoded.degraded,
                "store returned documents without metadata, delivering plain envelopes"
            );
        }

        debug!(
            range = %cursor.partition_range_id,
            count = decoded.envelopes.len(),
            next = %next,
            "read batch"
        );

        Ok(PollResult::Batch {
            changes: decoded.envelopes,
            next_cursor: cursor.advanced_to(next),
        })
    }
}
