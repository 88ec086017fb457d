//! Cursors command implementation.

use super::open_job;
use changefeed_engine::CursorStore;
use changefeed_protocol::Cursor;
use serde::Serialize;
use std::path::Path;

/// Persisted cursors of a job.
#[derive(Debug, Serialize)]
pub struct CursorListing {
    /// Job name.
    pub job: String,
    /// Cursor directory of the job.
    pub path: String,
    /// Saved cursors ordered by range.
    pub cursors: Vec<Cursor>,
}

/// Runs the cursors command.
pub fn run(cursor_dir: &Path, job: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listing = collect(cursor_dir, job)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        _ => {
            print_text_output(&listing);
        }
    }
    Ok(())
}

/// Reads every saved cursor of a job.
pub fn collect(cursor_dir: &Path, job: &str) -> Result<CursorListing, Box<dyn std::error::Error>> {
    let store = open_job(cursor_dir, job)?;
    Ok(CursorListing {
        job: job.to_string(),
        path: store.dir().display().to_string(),
        cursors: store.list()?,
    })
}

fn print_text_output(listing: &CursorListing) {
    println!("Job: {}", listing.job);
    println!("Path: {}", listing.path);
    println!();
    if listing.cursors.is_empty() {
        println!("No saved cursors; every range starts at the beginning.");
        return;
    }
    for cursor in &listing.cursors {
        println!("  {:<16} {}", cursor.partition_range_id, cursor.continuation);
    }
}
