//! CLI command implementations.

pub mod cursors;
pub mod reset;
pub mod run;

use changefeed_engine::FileCursorStore;
use std::path::Path;

/// Opens the cursor directory of an existing job.
pub fn open_job(cursor_dir: &Path, job: &str) -> Result<FileCursorStore, Box<dyn std::error::Error>> {
    let dir = cursor_dir.join(job);
    if !dir.is_dir() {
        return Err(format!("No cursors for job {:?} in {:?}", job, cursor_dir).into());
    }
    Ok(FileCursorStore::open(dir)?)
}
