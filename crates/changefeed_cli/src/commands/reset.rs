//! Reset command implementation.

use super::open_job;
use changefeed_engine::CursorStore;
use changefeed_protocol::PartitionRangeId;
use std::path::Path;

/// Runs the reset command.
///
/// The range's next run starts from the beginning of its change feed.
pub fn run(cursor_dir: &Path, job: &str, range: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_job(cursor_dir, job)?;
    let range = PartitionRangeId::new(range);
    let previous = store.load(&range)?;
    store.reset(&range)?;

    if previous.is_beginning() {
        println!("Range {} of job {} already starts at the beginning", range, job);
    } else {
        println!(
            "Reset range {} of job {} from {} to the beginning",
            range, job, previous.continuation
        );
    }
    Ok(())
}
