//! Cursor persistence.
//!
//! Each partition range has a single writer (the loop that owns it). Stores
//! are internally synchronized so loops for different ranges can share one
//! store, and a save is never observed half-written by a concurrent load.

use crate::error::PersistError;
use changefeed_protocol::{Cursor, PartitionRangeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Durable cursor storage keyed by partition range.
pub trait CursorStore: Send + Sync {
    /// Loads the cursor for a range, or the beginning cursor if none was saved.
    fn load(&self, partition_range_id: &PartitionRangeId) -> Result<Cursor, PersistError>;

    /// Saves a cursor, replacing the previous one for its range.
    fn save(&self, cursor: &Cursor) -> Result<(), PersistError>;

    /// Forgets the cursor for a range so the next load starts at the beginning.
    fn reset(&self, partition_range_id: &PartitionRangeId) -> Result<(), PersistError>;

    /// Returns all saved cursors ordered by range.
    fn list(&self) -> Result<Vec<Cursor>, PersistError>;
}

impl<S: CursorStore + ?Sized> CursorStore for Arc<S> {
    fn load(&self, partition_range_id: &PartitionRangeId) -> Result<Cursor, PersistError> {
        (**self).load(partition_range_id)
    }

    fn save(&self, cursor: &Cursor) -> Result<(), PersistError> {
        (**self).save(cursor)
    }

    fn reset(&self, partition_range_id: &PartitionRangeId) -> Result<(), PersistError> {
        (**self).reset(partition_range_id)
    }

    fn list(&self) -> Result<Vec<Cursor>, PersistError> {
        (**self).list()
    }
}

/// An in-memory cursor store for tests and ephemeral jobs.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<PartitionRangeId, Cursor>>,
}

impl MemoryCursorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of saved cursors.
    pub fn len(&self) -> usize {
        self.cursors.read().len()
    }

    /// Returns true if nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.cursors.read().is_empty()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, partition_range_id: &PartitionRangeId) -> Result<Cursor, PersistError> {
        Ok(self
            .cursors
            .read()
            .get(partition_range_id)
            .cloned()
            .unwrap_or_else(|| Cursor::beginning(partition_range_id.clone())))
    }

    fn save(&self, cursor: &Cursor) -> Result<(), PersistError> {
        self.cursors
            .write()
            .insert(cursor.partition_range_id.clone(), cursor.clone());
        Ok(())
    }

    fn reset(&self, partition_range_id: &PartitionRangeId) -> Result<(), PersistError> {
        self.cursors.write().remove(partition_range_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cursor>, PersistError> {
        let mut cursors: Vec<Cursor> = self.cursors.read().values().cloned().collect();
        cursors.sort_by(|a, b| a.partition_range_id.cmp(&b.partition_range_id));
        Ok(cursors)
    }
}

/// A directory of JSON cursor files, one per range.
///
/// Saves go through a temporary file in the same directory that is renamed
/// over the target, so a reader sees either the old or the new cursor.
#[derive(Debug)]
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    /// Opens (and creates if needed) a cursor directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Returns the cursor directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file backing a range.
    pub fn path_for(&self, partition_range_id: &PartitionRangeId) -> PathBuf {
        self.dir
            .join(format!("{}.json", encode_file_stem(partition_range_id.as_str())))
    }

    fn read_file(&self, path: &Path) -> Result<Option<Cursor>, PersistError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| PersistError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self, partition_range_id: &PartitionRangeId) -> Result<Cursor, PersistError> {
        let path = self.path_for(partition_range_id);
        match self.read_file(&path)? {
            Some(cursor) if cursor.partition_range_id == *partition_range_id => Ok(cursor),
            Some(cursor) => Err(PersistError::Corrupt {
                path,
                reason: format!(
                    "file holds cursor for range {}, expected {}",
                    cursor.partition_range_id, partition_range_id
                ),
            }),
            None => Ok(Cursor::beginning(partition_range_id.clone())),
        }
    }

    fn save(&self, cursor: &Cursor) -> Result<(), PersistError> {
        let path = self.path_for(&cursor.partition_range_id);
        let mut file = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut file, cursor)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| PersistError::Io(e.error))?;
        Ok(())
    }

    fn reset(&self, partition_range_id: &PartitionRangeId) -> Result<(), PersistError> {
        match fs::remove_file(self.path_for(partition_range_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<Cursor>, PersistError> {
        let mut cursors = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(cursor) = self.read_file(&path)? {
                cursors.push(cursor);
            }
        }
        cursors.sort_by(|a, b| a.partition_range_id.cmp(&b.partition_range_id));
        Ok(cursors)
    }
}

/// Hex-encodes a range id so any id maps to a safe file name.
fn encode_file_stem(id: &str) -> String {
    id.bytes().map(|b| format!("{b:02x}")).collect()
}
