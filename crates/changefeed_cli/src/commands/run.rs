//! Run command implementation.

use crate::family::{self, Family};
use changefeed_engine::{
    ChangeFeedSource, ChangeHandler, CursorStore, FeedConfig, FeedEvent, FeedProcessor,
    FileCursorStore, HandlerError, MemoryCursorStore, RangeOutcome,
};
use changefeed_protocol::{ChangeEnvelope, DeliveryMode, DowngradePolicy, PartitionRangeId};
use changefeed_store::{MemoryDocumentStore, StoreConfig};
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// How often supervision checks for loop tasks that exited without an event.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Options of a consumption job.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Job name; cursors live under `<cursor_dir>/<job>`.
    pub job: String,
    /// Number of partition ranges in the reference store.
    pub partitions: u32,
    /// Ranges to consume. Empty means every range.
    pub ranges: Vec<String>,
    /// Directory for durable cursors. Cursors are kept in memory without it.
    pub cursor_dir: Option<PathBuf>,
    /// JSON file holding a `FeedConfig`.
    pub config: Option<PathBuf>,
    /// Delivery mode override.
    pub mode: Option<DeliveryMode>,
    /// Stop each range after this many consecutive empty polls.
    pub idle_polls: Option<u32>,
    /// Downgrade policy override.
    pub downgrade: Option<DowngradePolicy>,
    /// Page size hint override.
    pub page_size: Option<u32>,
}

/// Runs the run command.
pub fn run(options: &RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = feed_config(options)?;
    let store = Arc::new(MemoryDocumentStore::new(StoreConfig::new(options.partitions)));
    seed(&store)?;

    let ranges: Vec<PartitionRangeId> = if options.ranges.is_empty() {
        store.range_ids()
    } else {
        options.ranges.iter().map(PartitionRangeId::new).collect()
    };
    info!(job = %options.job, ranges = ranges.len(), mode = %config.mode, "starting job");

    let runtime = tokio::runtime::Runtime::new()?;
    let outcomes = match &options.cursor_dir {
        Some(dir) => {
            let cursors = Arc::new(FileCursorStore::open(dir.join(&options.job))?);
            runtime.block_on(consume(store, cursors, ranges, config))
        }
        None => runtime.block_on(consume(
            store,
            Arc::new(MemoryCursorStore::new()),
            ranges,
            config,
        )),
    };

    report(&outcomes)
}

/// Builds the feed configuration from the config file and overrides.
pub fn feed_config(options: &RunOptions) -> Result<FeedConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {:?}: {}", path, e))?;
            serde_json::from_str(&contents)?
        }
        None => FeedConfig::default(),
    };

    if let Some(mode) = options.mode {
        config.mode = mode;
    }
    if let Some(limit) = options.idle_polls {
        config = config.with_max_idle_polls(limit);
    }
    if let Some(policy) = options.downgrade {
        config = config.with_downgrade(policy);
    }
    if let Some(size) = options.page_size {
        config = config.with_page_size_hint(size);
    }
    config.validate()?;
    Ok(config)
}

fn seed(store: &MemoryDocumentStore) -> Result<(), Box<dyn std::error::Error>> {
    for family in family::samples() {
        let receipt = store.upsert_item(&family)?;
        println!(
            "Created item in database with id: {} ({}, lsn {})",
            family.id, receipt.partition_range_id, receipt.lsn
        );
    }
    println!();
    Ok(())
}

/// Runs the job until every range stops, or until Ctrl-C.
pub async fn consume<C>(
    store: Arc<MemoryDocumentStore>,
    cursors: Arc<C>,
    ranges: Vec<PartitionRangeId>,
    config: FeedConfig,
) -> Vec<(PartitionRangeId, RangeOutcome)>
where
    C: CursorStore + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut processor = FeedProcessor::new(store, cursors, config).with_events(tx);
    processor.start(ranges, |_: &PartitionRangeId| Printer);

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    supervise(&mut processor, &mut rx, interrupted).await
}

/// Prints events until every loop has exited, or shuts down on `interrupted`.
///
/// A loop task that panics emits no event, so task exits are polled as well.
async fn supervise<S, C>(
    processor: &mut FeedProcessor<S, C>,
    events: &mut UnboundedReceiver<FeedEvent>,
    interrupted: impl Future<Output = ()>,
) -> Vec<(PartitionRangeId, RangeOutcome)>
where
    S: ChangeFeedSource + Clone + 'static,
    C: CursorStore + Clone + 'static,
{
    tokio::pin!(interrupted);
    let mut exits = tokio::time::interval(EXIT_CHECK_INTERVAL);
    exits.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut running = processor.ranges().len();
    while running > 0 {
        tokio::select! {
            _ = &mut interrupted => {
                info!("interrupted, stopping consumption");
                return processor.shutdown().await;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if matches!(event, FeedEvent::Stopped { .. } | FeedEvent::Failed { .. }) {
                    running -= 1;
                }
                print_event(&event);
            }
            _ = exits.tick() => {
                if processor.is_finished() {
                    warn!(running, "loop tasks exited without reporting");
                    break;
                }
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    processor.join().await
}

/// Prints every change it receives.
struct Printer;

impl ChangeHandler<Family> for Printer {
    async fn handle(&mut self, change: &ChangeEnvelope<Family>) -> Result<(), HandlerError> {
        for line in describe(change) {
            println!("{line}");
        }
        Ok(())
    }
}

/// Formats a change for display.
pub fn describe(change: &ChangeEnvelope<Family>) -> Vec<String> {
    let family = change.document();
    let mut lines = vec![format!("Detected change for family {family}")];
    if let Some(metadata) = change.metadata() {
        let timestamp = family
            .ts
            .map(|ts| ts.to_string())
            .unwrap_or_else(|| metadata.operation_timestamp.clone());
        lines.push(format!(
            "Lsn {}, Conflict Resolved timestamp {}, timestamp {}",
            metadata.lsn, metadata.conflict_resolved_timestamp, timestamp
        ));
    }
    lines
}

fn print_event(event: &FeedEvent) {
    match event {
        FeedEvent::CursorReset { expired, reason } => {
            eprintln!(
                "Cursor {} expired ({}); restarted from the beginning, changes may have been missed",
                expired, reason
            );
        }
        FeedEvent::Failed {
            partition_range_id,
            error,
        } => {
            eprintln!("Range {} halted: {}", partition_range_id, error);
        }
        _ => {}
    }
}

fn report(outcomes: &[(PartitionRangeId, RangeOutcome)]) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    let mut failed = 0;
    for (range, outcome) in outcomes {
        match outcome {
            RangeOutcome::Stopped { cursor, reason } => {
                println!("{range}: stopped ({reason:?}) at {}", cursor.continuation);
            }
            RangeOutcome::Failed { error, .. } => {
                failed += 1;
                println!("{range}: failed: {error}");
            }
            RangeOutcome::Aborted { reason } => {
                failed += 1;
                println!("{range}: aborted: {reason}");
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} ranges did not stop cleanly", failed, outcomes.len()).into());
    }
    Ok(())
}
