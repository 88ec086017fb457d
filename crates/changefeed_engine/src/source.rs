//! Document store abstraction.

use crate::error::SourceError;
use changefeed_protocol::{ReadChangesRequest, ReadChangesResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// The read side of a document store's change feed.
///
/// This trait abstracts the store client, allowing for different
/// implementations (HTTP SDK, in-memory reference store, mock for testing).
pub trait ChangeFeedSource: Send + Sync {
    /// Reads the next page of changes after the request's continuation.
    fn read_changes(
        &self,
        request: &ReadChangesRequest,
    ) -> impl Future<Output = Result<ReadChangesResponse, SourceError>> + Send;
}

impl<S: ChangeFeedSource> ChangeFeedSource for Arc<S> {
    fn read_changes(
        &self,
        request: &ReadChangesRequest,
    ) -> impl Future<Output = Result<ReadChangesResponse, SourceError>> + Send {
        (**self).read_changes(request)
    }
}

/// A scripted source for testing.
///
/// Responses are returned in the order they were queued. Once the queue is
/// empty every read answers `NotModified`.
#[derive(Debug, Default)]
pub struct MockSource {
    responses: Mutex<VecDeque<Result<ReadChangesResponse, SourceError>>>,
    requests: Mutex<Vec<ReadChangesRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl MockSource {
    /// Creates a mock source with no queued responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: ReadChangesResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues an error.
    pub fn push_error(&self, error: SourceError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Delays every read by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<ReadChangesRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of queued responses not yet served.
    pub fn pending(&self) -> usize {
        self.responses.lock().len()
    }
}

impl ChangeFeedSource for MockSource {
    fn read_changes(
        &self,
        request: &ReadChangesRequest,
    ) -> impl Future<Output = Result<ReadChangesResponse, SourceError>> + Send {
        self.requests.lock().push(request.clone());
        let response = self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(ReadChangesResponse::NotModified {
                continuation: request.continuation.clone(),
            })
        });
        let latency = *self.latency.lock();

        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            response
        }
    }
}
