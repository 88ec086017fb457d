//! Consumption loop state machine.
//!
//! One loop owns one partition range: poll, dispatch, persist, advance.
//! The committed cursor only moves after every change of a batch was handled
//! and the new cursor was saved, so a crash at any point redelivers rather
//! than skips.

use crate::backoff::Backoff;
use crate::config::FeedConfig;
use crate::cursor_store::CursorStore;
use crate::dispatcher::{dispatch, ChangeHandler};
use crate::error::FeedError;
use crate::poller::{FeedPoller, PollResult};
use crate::source::ChangeFeedSource;
use changefeed_protocol::{Cursor, PartitionRangeId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The current state of a consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the store to answer a read.
    Polling,
    /// Delivering a batch to the handler.
    Dispatching,
    /// Saving the cursor of a delivered batch.
    Persisting,
    /// Sleeping before the next poll.
    Backoff,
    /// Stopped cleanly.
    Stopped,
    /// Halted on a fatal error.
    Failed,
}

/// Counters for one consumption loop.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    /// Reads issued.
    pub polls: u64,
    /// Reads that returned nothing new.
    pub empty_polls: u64,
    /// Batches delivered and committed.
    pub batches_committed: u64,
    /// Changes handled in committed batches.
    pub changes_delivered: u64,
    /// Batches handed back for redelivery after a handler failure.
    pub redeliveries: u64,
    /// Transient read failures.
    pub retries: u64,
    /// Failed cursor saves.
    pub persist_failures: u64,
    /// Times the cursor expired and was reset.
    pub cursor_resets: u64,
    /// Time of the last commit.
    pub last_commit: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Shared, observable status of a loop.
///
/// Cloning yields another handle to the same status.
#[derive(Debug, Clone)]
pub struct LoopStatus {
    inner: Arc<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    state: RwLock<LoopState>,
    stats: RwLock<FeedStats>,
    cursor: RwLock<Cursor>,
}

impl LoopStatus {
    fn new(partition_range_id: PartitionRangeId) -> Self {
        Self {
            inner: Arc::new(StatusInner {
                state: RwLock::new(LoopState::Polling),
                stats: RwLock::new(FeedStats::default()),
                cursor: RwLock::new(Cursor::beginning(partition_range_id)),
            }),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> LoopState {
        *self.inner.state.read()
    }

    /// Gets a snapshot of the counters.
    pub fn stats(&self) -> FeedStats {
        self.inner.stats.read().clone()
    }

    /// Gets the last committed cursor.
    pub fn cursor(&self) -> Cursor {
        self.inner.cursor.read().clone()
    }

    fn set_state(&self, state: LoopState) {
        *self.inner.state.write() = state;
    }

    fn set_cursor(&self, cursor: Cursor) {
        *self.inner.cursor.write() = cursor;
    }

    fn update(&self, f: impl FnOnce(&mut FeedStats)) {
        f(&mut self.inner.stats.write());
    }
}

/// Notifications emitted by a loop.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The loop loaded its cursor and started polling.
    Started {
        /// Loop cursor at start.
        cursor: Cursor,
    },
    /// A batch was delivered and its cursor saved.
    BatchCommitted {
        /// New committed cursor.
        cursor: Cursor,
        /// Number of changes in the batch.
        count: usize,
    },
    /// The cursor expired and was reset; changes may have been missed.
    CursorReset {
        /// The rejected cursor.
        expired: Cursor,
        /// Store explanation.
        reason: String,
    },
    /// The loop halted on a fatal error.
    Failed {
        /// Range that halted.
        partition_range_id: PartitionRangeId,
        /// Error message.
        error: String,
    },
    /// The loop stopped cleanly.
    Stopped {
        /// Final committed cursor.
        cursor: Cursor,
        /// Why it stopped.
        reason: StopReason,
    },
}

impl FeedEvent {
    /// Returns the range the event belongs to.
    pub fn partition_range_id(&self) -> &PartitionRangeId {
        match self {
            FeedEvent::Started { cursor }
            | FeedEvent::BatchCommitted { cursor, .. }
            | FeedEvent::Stopped { cursor, .. } => &cursor.partition_range_id,
            FeedEvent::CursorReset { expired, .. } => &expired.partition_range_id,
            FeedEvent::Failed {
                partition_range_id, ..
            } => partition_range_id,
        }
    }
}

/// Why a loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Cancellation was requested.
    Cancelled,
    /// The configured number of consecutive empty polls was reached.
    Idle,
}

/// Final result of one range's consumption.
#[derive(Debug)]
pub enum RangeOutcome {
    /// The loop exited cleanly.
    Stopped {
        /// Last committed cursor.
        cursor: Cursor,
        /// Why it stopped.
        reason: StopReason,
    },
    /// The loop halted; other ranges are unaffected.
    Failed {
        /// Last committed cursor, if one was loaded.
        cursor: Option<Cursor>,
        /// The fatal error.
        error: FeedError,
    },
    /// The loop task did not finish on its own.
    Aborted {
        /// What happened to the task.
        reason: String,
    },
}

impl RangeOutcome {
    /// Returns true for `Stopped`.
    pub fn is_stopped(&self) -> bool {
        matches!(self, RangeOutcome::Stopped { .. })
    }

    /// Returns the last committed cursor, if known.
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            RangeOutcome::Stopped { cursor, .. } => Some(cursor),
            RangeOutcome::Failed { cursor, .. } => cursor.as_ref(),
            RangeOutcome::Aborted { .. } => None,
        }
    }

    /// Returns the fatal error of a failed loop.
    pub fn error(&self) -> Option<&FeedError> {
        match self {
            RangeOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Consumes one partition range until stopped.
pub struct ConsumptionLoop<S, C, H, T> {
    context: LoopContext<S, C, T>,
    handler: H,
}

/// Loop state other than the handler.
struct LoopContext<S, C, T> {
    partition_range_id: PartitionRangeId,
    poller: FeedPoller<S, T>,
    store: C,
    config: FeedConfig,
    cancel: CancellationToken,
    events: Option<UnboundedSender<FeedEvent>>,
    status: LoopStatus,
}

impl<S, C, H, T> ConsumptionLoop<S, C, H, T>
where
    S: ChangeFeedSource,
    C: CursorStore,
    H: ChangeHandler<T>,
    T: DeserializeOwned + Send + Sync,
{
    /// Creates a loop for one range.
    pub fn new(
        partition_range_id: PartitionRangeId,
        source: S,
        store: C,
        handler: H,
        config: FeedConfig,
    ) -> Self {
        let poller = FeedPoller::new(source, config.mode)
            .with_downgrade_policy(config.downgrade)
            .with_extra_headers(config.extra_headers.clone());
        let status = LoopStatus::new(partition_range_id.clone());
        Self {
            context: LoopContext {
                partition_range_id,
                poller,
                store,
                config,
                cancel: CancellationToken::new(),
                events: None,
                status,
            },
            handler,
        }
    }

    /// Uses `token` to stop the loop.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.context.cancel = token;
        self
    }

    /// Sends notifications to `events`.
    pub fn with_events(mut self, events: UnboundedSender<FeedEvent>) -> Self {
        self.context.events = Some(events);
        self
    }

    /// Returns the range this loop consumes.
    pub fn partition_range_id(&self) -> &PartitionRangeId {
        &self.context.partition_range_id
    }

    /// Gets the current state.
    pub fn state(&self) -> LoopState {
        self.context.status.state()
    }

    /// Returns a handle for observing the loop while it runs.
    pub fn status(&self) -> LoopStatus {
        self.context.status.clone()
    }

    /// Runs until cancelled, idle, or halted by a fatal error.
    pub async fn run(self) -> RangeOutcome {
        let Self {
            context,
            mut handler,
        } = self;
        context.run(&mut handler).await
    }
}

impl<S, C, T> LoopContext<S, C, T>
where
    S: ChangeFeedSource,
    C: CursorStore,
    T: DeserializeOwned + Send + Sync,
{
    async fn run<H: ChangeHandler<T>>(&self, handler: &mut H) -> RangeOutcome {
        if let Err(e) = self.config.validate() {
            return self.fail(None, e.into());
        }
        let mut cursor = match self.store.load(&self.partition_range_id) {
            Ok(cursor) => cursor,
            Err(e) => return self.fail(None, e.into()),
        };
        self.status.set_cursor(cursor.clone());
        info!(range = %self.partition_range_id, cursor = %cursor, "consumption loop started");
        self.emit(FeedEvent::Started {
            cursor: cursor.clone(),
        });

        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut idle_polls: u32 = 0;
        let mut failed_deliveries: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return self.stop(cursor, StopReason::Cancelled);
            }

            self.status.set_state(LoopState::Polling);
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.stop(cursor, StopReason::Cancelled),
                polled = self.poller.poll(&cursor, self.config.page_size_hint, self.config.poll_timeout) => polled,
            };
            self.status.update(|stats| stats.polls += 1);

            let delay = match polled {
                Ok(PollResult::NoChanges) => {
                    idle_polls = idle_polls.saturating_add(1);
                    self.status.update(|stats| stats.empty_polls += 1);
                    if self
                        .config
                        .max_idle_polls
                        .is_some_and(|limit| idle_polls >= limit)
                    {
                        return self.stop(cursor, StopReason::Idle);
                    }
                    backoff.next_delay()
                }

                Ok(PollResult::Batch {
                    changes,
                    next_cursor,
                }) => {
                    // Redeliveries of a failing batch wait the initial delay.
                    idle_polls = 0;
                    backoff.reset();
                    self.status.set_state(LoopState::Dispatching);
                    match dispatch(&self.partition_range_id, &changes, handler).await {
                        Ok(report) => {
                            failed_deliveries = 0;
                            self.status.set_state(LoopState::Persisting);
                            match self.persist(&next_cursor).await {
                                Ok(()) => {}
                                Err(FeedError::Cancelled) => {
                                    return self.stop(cursor, StopReason::Cancelled)
                                }
                                Err(e) => return self.fail(Some(cursor), e),
                            }

                            cursor = next_cursor;
                            self.status.set_cursor(cursor.clone());
                            self.status.update(|stats| {
                                stats.batches_committed += 1;
                                stats.changes_delivered += report.delivered as u64;
                                stats.last_commit = Some(Instant::now());
                            });
                            info!(
                                range = %self.partition_range_id,
                                count = report.delivered,
                                cursor = %cursor,
                                "committed batch"
                            );
                            self.emit(FeedEvent::BatchCommitted {
                                cursor: cursor.clone(),
                                count: report.delivered,
                            });
                            continue;
                        }
                        Err(e) => {
                            failed_deliveries = failed_deliveries.saturating_add(1);
                            if self
                                .config
                                .max_redeliveries
                                .is_some_and(|limit| failed_deliveries > limit)
                            {
                                return self.fail(Some(cursor), e.into());
                            }
                            let message = e.to_string();
                            self.status.update(|stats| {
                                stats.redeliveries += 1;
                                stats.last_error = Some(message);
                            });
                            let delay = backoff.next_delay();
                            warn!(
                                range = %self.partition_range_id,
                                failed_index = e.failed_index,
                                attempt = failed_deliveries,
                                delay_ms = delay.as_millis() as u64,
                                error = %e.source,
                                "handler failed, batch will be redelivered"
                            );
                            delay
                        }
                    }
                }

                Err(FeedError::CursorExpired {
                    partition_range_id,
                    cursor: expired,
                    reason,
                }) => {
                    warn!(
                        range = %partition_range_id,
                        cursor = %expired,
                        %reason,
                        "cursor expired, changes may have been missed; resetting to the beginning"
                    );
                    self.status.update(|stats| {
                        stats.cursor_resets += 1;
                        stats.last_error = Some(reason.clone());
                    });
                    self.emit(FeedEvent::CursorReset {
                        expired: expired.clone(),
                        reason: reason.clone(),
                    });

                    if let Err(e) = self.store.reset(&partition_range_id) {
                        return self.fail(Some(expired), e.into());
                    }
                    cursor = Cursor::beginning(partition_range_id.clone());
                    self.status.set_cursor(cursor.clone());

                    // A beginning cursor that expires would loop forever.
                    if !self.config.restart_on_expired || expired.is_beginning() {
                        return self.fail(
                            Some(cursor),
                            FeedError::CursorExpired {
                                partition_range_id,
                                cursor: expired,
                                reason,
                            },
                        );
                    }
                    backoff.reset();
                    continue;
                }

                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay_with_hint(e.retry_after());
                    let message = e.to_string();
                    warn!(
                        range = %self.partition_range_id,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "poll failed, retrying"
                    );
                    self.status.update(|stats| {
                        stats.retries += 1;
                        stats.last_error = Some(message);
                    });
                    delay
                }

                Err(e) => return self.fail(Some(cursor), e),
            };

            debug!(
                range = %self.partition_range_id,
                delay_ms = delay.as_millis() as u64,
                "backing off"
            );
            if !self.pause(delay).await {
                return self.stop(cursor, StopReason::Cancelled);
            }
        }
    }

    /// Saves `cursor`, retrying with backoff up to `persist_attempts` times.
    async fn persist(&self, cursor: &Cursor) -> Result<(), FeedError> {
        let attempts = self.config.persist_attempts.max(1);
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut attempt = 1;
        loop {
            match self.store.save(cursor) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.status.update(|stats| {
                        stats.persist_failures += 1;
                        stats.last_error = Some(e.to_string());
                    });
                    if attempt >= attempts {
                        return Err(e.into());
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        range = %self.partition_range_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "cursor save failed, retrying"
                    );
                    if !self.pause(delay).await {
                        return Err(FeedError::Cancelled);
                    }
                    self.status.set_state(LoopState::Persisting);
                    attempt += 1;
                }
            }
        }
    }

    /// Sleeps for `delay`. Returns false if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        self.status.set_state(LoopState::Backoff);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn stop(&self, cursor: Cursor, reason: StopReason) -> RangeOutcome {
        info!(
            range = %self.partition_range_id,
            cursor = %cursor,
            ?reason,
            "consumption loop stopped"
        );
        self.status.set_state(LoopState::Stopped);
        self.emit(FeedEvent::Stopped {
            cursor: cursor.clone(),
            reason,
        });
        RangeOutcome::Stopped { cursor, reason }
    }

    fn fail(&self, cursor: Option<Cursor>, error: FeedError) -> RangeOutcome {
        let message = error.to_string();
        error!(range = %self.partition_range_id, error = %message, "consumption loop halted");
        self.status.set_state(LoopState::Failed);
        self.status
            .update(|stats| stats.last_error = Some(message.clone()));
        self.emit(FeedEvent::Failed {
            partition_range_id: self.partition_range_id.clone(),
            error: message,
        });
        RangeOutcome::Failed { cursor, error }
    }

    fn emit(&self, event: FeedEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::cursor_store::MemoryCursorStore;
    use crate::error::{HandlerError, PersistError, SourceError};
    use crate::source::MockSource;
    use changefeed_protocol::{
        ChangeEnvelope, ContinuationToken, DeliveryMode, ProtocolError, RawPage,
        ReadChangesResponse,
    };
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Doc {
        id: String,
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    fn entry(id: &str, lsn: u64) -> Value {
        json!({
            "current": { "id": id, "_ts": 1000 + lsn },
            "metadata": { "lsn": lsn, "crts": 2000 + lsn }
        })
    }

    fn page(ids: &[&str], continuation: &str) -> ReadChangesResponse {
        let entries = ids
            .iter()
            .enumerate()
            .map(|(i, id)| entry(id, i as u64 + 1))
            .collect();
        ReadChangesResponse::Page(RawPage::new(entries, continuation))
    }

    fn config() -> FeedConfig {
        FeedConfig::default()
            .with_backoff(BackoffConfig::default().without_jitter())
            .with_max_idle_polls(1)
    }

    fn recorder(seen: &Seen) -> impl FnMut(&ChangeEnvelope<Doc>) -> Result<(), HandlerError> + Send {
        let seen = Arc::clone(seen);
        move |change: &ChangeEnvelope<Doc>| {
            seen.lock().push(change.document().id.clone());
            Ok(())
        }
    }

    fn range() -> PartitionRangeId {
        "range-0".into()
    }

    fn at(token: &str) -> Cursor {
        Cursor::new(range(), ContinuationToken::token(token))
    }

    #[tokio::test(start_paused = true)]
    async fn committed_batch_advances_cursor() {
        let source = Arc::new(MockSource::new());
        source.push_response(page(&["a", "b"], "2"));
        let store = Arc::new(MemoryCursorStore::new());
        let seen = Seen::default();

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&seen),
            config(),
        );
        let status = consumer.status();
        let outcome = consumer.run().await;

        assert!(outcome.is_stopped());
        assert_eq!(outcome.cursor(), Some(&at("2")));
        assert_eq!(store.load(&range()).unwrap(), at("2"));
        assert_eq!(*seen.lock(), ["a", "b"]);

        // The old cursor is never polled again.
        let requests = source.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].continuation.is_beginning());
        assert_eq!(requests[1].continuation, ContinuationToken::token("2"));

        let stats = status.stats();
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.changes_delivered, 2);
        assert_eq!(status.state(), LoopState::Stopped);
        assert_eq!(status.cursor(), at("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_redelivers_whole_batch() {
        let source = Arc::new(MockSource::new());
        source.push_response(page(&["a", "b", "c"], "3"));
        source.push_response(page(&["a", "b", "c"], "3"));
        let store = Arc::new(MemoryCursorStore::new());

        let seen = Seen::default();
        let mut failed_once = false;
        let handler = {
            let seen = Arc::clone(&seen);
            move |change: &ChangeEnvelope<Doc>| -> Result<(), HandlerError> {
                let id = change.document().id.clone();
                seen.lock().push(id.clone());
                if id == "b" && !failed_once {
                    failed_once = true;
                    return Err(HandlerError::new("transient handler failure"));
                }
                Ok(())
            }
        };

        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            handler,
            config(),
        )
        .run()
        .await;

        assert_eq!(outcome.cursor(), Some(&at("3")));
        // "c" was not invoked on the failed delivery; "a" is delivered again.
        assert_eq!(*seen.lock(), ["a", "b", "a", "b", "c"]);

        let requests = source.requests();
        assert_eq!(requests[0].continuation, requests[1].continuation);
        assert!(requests[1].continuation.is_beginning());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_polls_back_off_with_same_cursor() {
        let source = Arc::new(MockSource::new());
        let store = Arc::new(MemoryCursorStore::new());
        store.save(&at("7")).unwrap();

        let started = tokio::time::Instant::now();
        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&Seen::default()),
            config().with_max_idle_polls(3),
        )
        .run()
        .await;

        // 1s then 2s of backoff; the third empty poll stops the loop.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(outcome.cursor(), Some(&at("7")));
        assert!(matches!(
            outcome,
            RangeOutcome::Stopped {
                reason: StopReason::Idle,
                ..
            }
        ));

        let requests = source.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests
            .iter()
            .all(|r| r.continuation == ContinuationToken::token("7")));
        assert_eq!(store.load(&range()).unwrap(), at("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cursor_resets_and_notifies() {
        let source = Arc::new(MockSource::new());
        source.push_error(SourceError::Gone {
            reason: "log truncated".into(),
        });
        source.push_response(page(&["a"], "1"));
        let store = Arc::new(MemoryCursorStore::new());
        store.save(&at("5")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&Seen::default()),
            config(),
        )
        .with_events(tx)
        .run()
        .await;

        assert_eq!(outcome.cursor(), Some(&at("1")));
        assert!(source.requests()[1].continuation.is_beginning());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events[0], FeedEvent::Started { cursor: at("5") });
        assert_eq!(
            events[1],
            FeedEvent::CursorReset {
                expired: at("5"),
                reason: "log truncated".into(),
            }
        );
        assert_eq!(
            events[2],
            FeedEvent::BatchCommitted {
                cursor: at("1"),
                count: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cursor_halts_without_restart() {
        let source = Arc::new(MockSource::new());
        source.push_error(SourceError::Gone {
            reason: "log truncated".into(),
        });
        let store = Arc::new(MemoryCursorStore::new());
        store.save(&at("5")).unwrap();

        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&Seen::default()),
            config().with_restart_on_expired(false),
        )
        .run()
        .await;

        assert!(matches!(
            outcome.error(),
            Some(FeedError::CursorExpired { .. })
        ));
        // The stored cursor was still reset.
        assert!(store.load(&range()).unwrap().is_beginning());
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_honours_retry_hint() {
        let source = Arc::new(MockSource::new());
        source.push_error(SourceError::Throttled {
            retry_after: Some(Duration::from_secs(5)),
        });
        source.push_response(page(&["a"], "1"));
        let store = Arc::new(MemoryCursorStore::new());

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&Seen::default()),
            config(),
        );
        let status = consumer.status();
        let started = tokio::time::Instant::now();
        let outcome = consumer.run().await;

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(outcome.cursor(), Some(&at("1")));
        assert_eq!(status.stats().retries, 1);
        assert_eq!(source.requests()[0].continuation, source.requests()[1].continuation);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_halt_without_advancing() {
        let source = Arc::new(MockSource::new());
        source.push_error(SourceError::PartitionNotFound("range-0".into()));
        let store = Arc::new(MemoryCursorStore::new());

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&Seen::default()),
            config(),
        );
        let status = consumer.status();
        let outcome = consumer.run().await;

        assert!(matches!(
            outcome.error(),
            Some(FeedError::Source(SourceError::PartitionNotFound(_)))
        ));
        assert_eq!(status.state(), LoopState::Failed);
        assert!(status.stats().last_error.is_some());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_entry_is_fatal() {
        let source = Arc::new(MockSource::new());
        source.push_response(ReadChangesResponse::Page(RawPage::new(
            vec![entry("a", 1), json!({ "current": { "id": 7 }, "metadata": { "lsn": 2, "crts": 3 } })],
            "2",
        )));
        let store = Arc::new(MemoryCursorStore::new());
        let seen = Seen::default();

        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&seen),
            config(),
        )
        .run()
        .await;

        assert!(matches!(
            outcome.error(),
            Some(FeedError::Protocol(ProtocolError::Decode { index: 1, .. }))
        ));
        assert!(seen.lock().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_limit_halts_range() {
        let source = Arc::new(MockSource::new());
        for _ in 0..3 {
            source.push_response(page(&["a"], "1"));
        }
        let store = Arc::new(MemoryCursorStore::new());
        let calls = Arc::new(Mutex::new(0));
        let handler = {
            let calls = Arc::clone(&calls);
            move |_: &ChangeEnvelope<Doc>| -> Result<(), HandlerError> {
                *calls.lock() += 1;
                Err(HandlerError::new("always fails"))
            }
        };

        let started = tokio::time::Instant::now();
        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            handler,
            config().with_max_redeliveries(2),
        )
        .run()
        .await;

        // The first delivery plus two redeliveries, each after the initial delay.
        assert!(matches!(outcome.error(), Some(FeedError::Dispatch(_))));
        assert_eq!(*calls.lock(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(outcome.cursor().is_some_and(Cursor::is_beginning));
        assert!(store.is_empty());
    }

    struct BrokenStore;

    impl CursorStore for BrokenStore {
        fn load(&self, partition_range_id: &PartitionRangeId) -> Result<Cursor, PersistError> {
            Ok(Cursor::beginning(partition_range_id.clone()))
        }

        fn save(&self, _cursor: &Cursor) -> Result<(), PersistError> {
            Err(PersistError::Io(std::io::Error::other("disk full")))
        }

        fn reset(&self, _partition_range_id: &PartitionRangeId) -> Result<(), PersistError> {
            Ok(())
        }

        fn list(&self) -> Result<Vec<Cursor>, PersistError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_persist_attempts_keep_old_cursor() {
        let source = Arc::new(MockSource::new());
        source.push_response(page(&["a"], "1"));

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            BrokenStore,
            recorder(&Seen::default()),
            config().with_persist_attempts(3),
        );
        let status = consumer.status();
        let outcome = consumer.run().await;

        assert!(matches!(outcome.error(), Some(FeedError::Persist(_))));
        assert!(outcome.cursor().is_some_and(Cursor::is_beginning));
        assert_eq!(status.stats().persist_failures, 3);
        assert!(status.cursor().is_beginning());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_persist_retries_keeps_old_cursor() {
        let source = Arc::new(MockSource::new());
        source.push_response(page(&["a"], "1"));
        let token = CancellationToken::new();

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            BrokenStore,
            recorder(&Seen::default()),
            config().with_persist_attempts(5).with_backoff(
                BackoffConfig::new(Duration::from_secs(10), Duration::from_secs(60))
                    .without_jitter(),
            ),
        )
        .with_cancellation(token.clone());
        let status = consumer.status();
        let task = tokio::spawn(consumer.run());

        // The first save failed and the loop waits 10s before the second.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.state(), LoopState::Backoff);
        assert_eq!(status.stats().persist_failures, 1);
        token.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        match outcome {
            RangeOutcome::Stopped { cursor, reason } => {
                assert_eq!(reason, StopReason::Cancelled);
                assert!(cursor.is_beginning());
            }
            other => panic!("expected a cancelled stop, got {other:?}"),
        }
        assert_eq!(status.stats().persist_failures, 1);
        assert_eq!(status.stats().batches_committed, 0);
        assert!(status.cursor().is_beginning());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_backoff_halts_before_polling() {
        let source = Arc::new(MockSource::new());
        source.push_response(page(&["a"], "1"));
        let config: FeedConfig =
            serde_json::from_str(r#"{ "backoff": { "jitter": 1.5 } }"#).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            MemoryCursorStore::new(),
            recorder(&Seen::default()),
            config,
        )
        .with_events(tx);
        let status = consumer.status();
        let outcome = consumer.run().await;

        match outcome.error() {
            Some(FeedError::Config(e)) => assert_eq!(e.field, "backoff.jitter"),
            other => panic!("expected a config error, got {other:?}"),
        }
        assert!(outcome.cursor().is_none());
        assert!(source.requests().is_empty());
        assert_eq!(status.state(), LoopState::Failed);
        assert!(matches!(rx.try_recv(), Ok(FeedEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_inflight_poll() {
        let source = Arc::new(MockSource::new());
        source.set_latency(Duration::from_secs(3600));
        let store = Arc::new(MemoryCursorStore::new());
        store.save(&at("4")).unwrap();
        let token = CancellationToken::new();

        let consumer = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            Arc::clone(&store),
            recorder(&Seen::default()),
            FeedConfig::default().with_poll_timeout(Duration::from_secs(7200)),
        )
        .with_cancellation(token.clone());
        let status = consumer.status();
        let task = tokio::spawn(consumer.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.state(), LoopState::Polling);
        token.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            RangeOutcome::Stopped {
                reason: StopReason::Cancelled,
                ..
            }
        ));
        assert_eq!(store.load(&range()).unwrap(), at("4"));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_mode_delivers_bare_documents() {
        let source = Arc::new(MockSource::new());
        source.push_response(ReadChangesResponse::Page(RawPage::new(
            vec![json!({ "id": "a" }), json!({ "id": "b" })],
            "2",
        )));
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let kinds = Arc::clone(&kinds);
            move |change: &ChangeEnvelope<Doc>| -> Result<(), HandlerError> {
                kinds.lock().push(change.is_enriched());
                Ok(())
            }
        };

        let outcome = ConsumptionLoop::new(
            range(),
            Arc::clone(&source),
            MemoryCursorStore::new(),
            handler,
            FeedConfig::new(DeliveryMode::Plain)
                .with_backoff(BackoffConfig::default().without_jitter())
                .with_max_idle_polls(1),
        )
        .run()
        .await;

        assert_eq!(outcome.cursor(), Some(&at("2")));
        assert_eq!(*kinds.lock(), [false, false]);
    }
}
