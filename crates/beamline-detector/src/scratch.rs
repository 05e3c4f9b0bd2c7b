//! The detector's scratch directory.
//!
//! The detector daemon writes `<zero-padded image number>.<ext>` files here.
//! The coordinator only reads, except for emptying the directory at the
//! start of a series and deleting the oldest files to bound its size. Both
//! deletions tolerate files vanishing underneath them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use beamline_core::timestamp;

use crate::error::{DetectorError, Result};

/// One image file seen in the scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchEntry {
    /// File name without directory
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// Image number parsed from the name
    pub image_number: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: f64,
}

/// Image number of `name`: the decimal stem of `<digits>.<extension>`.
pub fn image_number(name: &str, extension: &str) -> Option<u64> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Scratch directory accessor.
#[derive(Debug, Clone)]
pub struct ScratchDirectory {
    path: PathBuf,
    extension: String,
}

impl ScratchDirectory {
    /// Directory `path` holding `*.extension` images.
    pub fn new(path: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            extension: extension.into(),
        }
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Image files currently present, ordered by image number.
    ///
    /// A missing directory lists as empty.
    pub fn list(&self) -> Result<Vec<ScratchEntry>> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DetectorError::io(&self.path, e)),
        };
        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DetectorError::io(&self.path, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(number) = image_number(&name, &self.extension) else {
                continue;
            };
            // Deleted between read_dir and stat
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            images.push(ScratchEntry {
                path: entry.path(),
                name,
                image_number: number,
                mtime: timestamp::from_system_time(modified),
            });
        }
        images.sort_by_key(|e| e.image_number);
        Ok(images)
    }

    /// Delete every image file. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        fs::create_dir_all(&self.path).map_err(|e| DetectorError::io(&self.path, e))?;
        let mut removed = 0;
        for entry in self.list()? {
            if remove_tolerant(&entry.path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the oldest images until at most `keep` remain.
    ///
    /// Returns the entries that were deleted.
    pub fn enforce_limit(&self, keep: usize) -> Result<Vec<ScratchEntry>> {
        let images = self.list()?;
        let excess = images.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for entry in images.into_iter().take(excess) {
            if remove_tolerant(&entry.path)? {
                removed.push(entry);
            }
        }
        Ok(removed)
    }
}

fn remove_tolerant(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DetectorError::io(path, e)),
    }
}
