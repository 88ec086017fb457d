//! Runs one consumption loop per partition range.

use crate::config::FeedConfig;
use crate::consumer::{ConsumptionLoop, FeedEvent, FeedStats, LoopState, LoopStatus, RangeOutcome};
use crate::cursor_store::CursorStore;
use crate::dispatcher::ChangeHandler;
use crate::source::ChangeFeedSource;
use changefeed_protocol::PartitionRangeId;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct RangeTask {
    partition_range_id: PartitionRangeId,
    status: LoopStatus,
    handle: JoinHandle<RangeOutcome>,
}

/// Spawns and supervises consumption loops.
///
/// Loops run as independent tokio tasks and share the source and cursor
/// store. A range that halts does not affect the others.
pub struct FeedProcessor<S, C> {
    source: S,
    store: C,
    config: FeedConfig,
    cancel: CancellationToken,
    events: Option<UnboundedSender<FeedEvent>>,
    tasks: Vec<RangeTask>,
}

impl<S, C> FeedProcessor<S, C>
where
    S: ChangeFeedSource + Clone + 'static,
    C: CursorStore + Clone + 'static,
{
    /// Creates a processor. Nothing runs until [`start`](Self::start).
    pub fn new(source: S, store: C, config: FeedConfig) -> Self {
        Self {
            source,
            store,
            config,
            cancel: CancellationToken::new(),
            events: None,
            tasks: Vec::new(),
        }
    }

    /// Sends every loop's notifications to `events`.
    pub fn with_events(mut self, events: UnboundedSender<FeedEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the token that stops all loops when cancelled.
    ///
    /// Cancelling it directly leaves the loops to finish on their own; collect
    /// their outcomes with [`join`](Self::join).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns a loop for each range, with a handler built per range.
    ///
    /// Ranges that already have a loop are skipped. Must be called from
    /// within a tokio runtime.
    pub fn start<T, H, F>(
        &mut self,
        ranges: impl IntoIterator<Item = PartitionRangeId>,
        mut make_handler: F,
    ) where
        T: DeserializeOwned + Send + Sync + 'static,
        H: ChangeHandler<T> + 'static,
        F: FnMut(&PartitionRangeId) -> H,
    {
        for partition_range_id in ranges {
            if self.status(&partition_range_id).is_some() {
                warn!(range = %partition_range_id, "range already has a consumption loop");
                continue;
            }

            let handler = make_handler(&partition_range_id);
            let mut consumer = ConsumptionLoop::new(
                partition_range_id.clone(),
                self.source.clone(),
                self.store.clone(),
                handler,
                self.config.clone(),
            )
            .with_cancellation(self.cancel.child_token());
            if let Some(events) = &self.events {
                consumer = consumer.with_events(events.clone());
            }

            let status = consumer.status();
            let handle = tokio::spawn(consumer.run());
            self.tasks.push(RangeTask {
                partition_range_id,
                status,
                handle,
            });
        }
        info!(ranges = self.tasks.len(), "feed processor started");
    }

    /// Returns the ranges with a loop, in start order.
    pub fn ranges(&self) -> Vec<PartitionRangeId> {
        self.tasks
            .iter()
            .map(|task| task.partition_range_id.clone())
            .collect()
    }

    /// Returns the status handle of a range's loop.
    pub fn status(&self, partition_range_id: &PartitionRangeId) -> Option<LoopStatus> {
        self.tasks
            .iter()
            .find(|task| task.partition_range_id == *partition_range_id)
            .map(|task| task.status.clone())
    }

    /// Gets the current state of a range's loop.
    pub fn state(&self, partition_range_id: &PartitionRangeId) -> Option<LoopState> {
        self.status(partition_range_id).map(|status| status.state())
    }

    /// Gets the counters of a range's loop.
    pub fn stats(&self, partition_range_id: &PartitionRangeId) -> Option<FeedStats> {
        self.status(partition_range_id).map(|status| status.stats())
    }

    /// Returns true once every loop has exited, including loops whose task
    /// panicked without emitting an event.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|task| task.handle.is_finished())
    }

    /// Waits for every loop to exit on its own.
    pub async fn join(&mut self) -> Vec<(PartitionRangeId, RangeOutcome)> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            let outcome = match task.handle.await {
                Ok(outcome) => outcome,
                Err(e) => RangeOutcome::Aborted {
                    reason: e.to_string(),
                },
            };
            outcomes.push((task.partition_range_id, outcome));
        }
        outcomes
    }

    /// Cancels every loop and waits up to the shutdown grace period.
    ///
    /// Loops still running when the grace period ends are aborted. Their
    /// last committed cursors remain valid.
    pub async fn shutdown(&mut self) -> Vec<(PartitionRangeId, RangeOutcome)> {
        info!(ranges = self.tasks.len(), "shutting down feed processor");
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;

        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for mut task in self.tasks.drain(..) {
            let outcome = match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => RangeOutcome::Aborted {
                    reason: e.to_string(),
                },
                Err(_) => {
                    task.handle.abort();
                    warn!(
                        range = %task.partition_range_id,
                        cursor = %task.status.cursor(),
                        "loop did not stop within the shutdown grace period, aborted"
                    );
                    RangeOutcome::Aborted {
                        reason: format!(
                            "did not stop within {:?}",
                            self.config.shutdown_grace
                        ),
                    }
                }
            };
            outcomes.push((task.partition_range_id, outcome));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::consumer::StopReason;
    use crate::cursor_store::MemoryCursorStore;
    use crate::error::{FeedError, HandlerError, SourceError};
    use changefeed_protocol::{
        ChangeEnvelope, ContinuationToken, Cursor, DeliveryMode, RawPage, ReadChangesRequest,
        ReadChangesResponse,
    };
    use serde_json::{json, Value};
    use std::future::{pending, ready, Future};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// One change per range at the beginning; the range named "bad" does
    /// not exist.
    #[derive(Clone)]
    struct SplitSource;

    impl ChangeFeedSource for SplitSource {
        fn read_changes(
            &self,
            request: &ReadChangesRequest,
        ) -> impl Future<Output = Result<ReadChangesResponse, SourceError>> + Send {
            let response = if request.partition_range_id.as_str() == "bad" {
                Err(SourceError::PartitionNotFound("bad".into()))
            } else if request.continuation.is_beginning() {
                Ok(ReadChangesResponse::Page(RawPage::new(
                    vec![json!({ "id": request.partition_range_id.as_str() })],
                    "1",
                )))
            } else {
                Ok(ReadChangesResponse::NotModified {
                    continuation: request.continuation.clone(),
                })
            };
            ready(response)
        }
    }

    fn config() -> FeedConfig {
        FeedConfig::new(DeliveryMode::Plain)
            .with_backoff(BackoffConfig::default().without_jitter())
    }

    fn accept(
        _: &PartitionRangeId,
    ) -> impl FnMut(&ChangeEnvelope<Value>) -> Result<(), HandlerError> + Send {
        |_: &ChangeEnvelope<Value>| Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failing_range_does_not_stop_others() {
        let store = Arc::new(MemoryCursorStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut processor =
            FeedProcessor::new(SplitSource, Arc::clone(&store), config().with_max_idle_polls(1))
                .with_events(tx);

        processor.start(["good".into(), "bad".into(), "good".into()], accept);
        let expected: Vec<PartitionRangeId> = vec!["good".into(), "bad".into()];
        assert_eq!(processor.ranges(), expected);

        let outcomes = processor.join().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_stopped());
        assert_eq!(
            outcomes[0].1.cursor(),
            Some(&Cursor::new("good".into(), ContinuationToken::token("1")))
        );
        assert!(matches!(
            outcomes[1].1.error(),
            Some(FeedError::Source(SourceError::PartitionNotFound(_)))
        ));
        assert_eq!(store.list().unwrap().len(), 1);

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FeedEvent::Failed { .. }) {
                failed.push(event.partition_range_id().clone());
            }
        }
        assert_eq!(failed, vec![PartitionRangeId::from("bad")]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_idle_loops() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut processor = FeedProcessor::new(SplitSource, Arc::clone(&store), config());
        processor.start(["a".into(), "b".into()], accept);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(processor.state(&"a".into()), Some(LoopState::Backoff));
        assert_eq!(processor.stats(&"b".into()).map(|s| s.batches_committed), Some(1));

        let outcomes = processor.shutdown().await;
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_stopped()));
        assert!(processor.ranges().is_empty());
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_token_stops_every_loop() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut processor = FeedProcessor::new(SplitSource, Arc::clone(&store), config());
        processor.start(["a".into(), "b".into()], accept);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!processor.is_finished());

        processor.cancellation_token().cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !processor.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let outcomes = processor.join().await;
        assert_eq!(outcomes.len(), 2);
        for (range, outcome) in &outcomes {
            match outcome {
                RangeOutcome::Stopped { cursor, reason } => {
                    assert_eq!(*reason, StopReason::Cancelled);
                    assert_eq!(
                        cursor,
                        &Cursor::new(range.clone(), ContinuationToken::token("1"))
                    );
                }
                other => panic!("expected a cancelled stop, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_fails_every_range() {
        let mut config = config();
        config.backoff.multiplier = -1.0;
        let mut processor =
            FeedProcessor::new(SplitSource, Arc::new(MemoryCursorStore::new()), config);
        processor.start(["a".into(), "b".into()], accept);

        let outcomes = processor.join().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome.error(), Some(FeedError::Config(_)))));
    }

    struct Stuck;

    impl ChangeHandler<Value> for Stuck {
        async fn handle(&mut self, _change: &ChangeEnvelope<Value>) -> Result<(), HandlerError> {
            pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_loops_past_grace() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut processor = FeedProcessor::new(
            SplitSource,
            Arc::clone(&store),
            config().with_shutdown_grace(Duration::from_secs(2)),
        );
        processor.start(["a".into()], |_: &PartitionRangeId| Stuck);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(processor.state(&"a".into()), Some(LoopState::Dispatching));

        let started = tokio::time::Instant::now();
        let outcomes = processor.shutdown().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(matches!(outcomes[0].1, RangeOutcome::Aborted { .. }));
        // Nothing was committed for the stuck batch.
        assert!(store.is_empty());
    }
}
