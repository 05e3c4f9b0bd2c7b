//! Moving scratch images into the archive.
//!
//! Hard links cost nothing and keep the scratch copy valid until it is
//! evicted. Across filesystems a byte copy is made instead, written to a
//! temporary file next to the destination and renamed into place, with the
//! source modification time carried over.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use crate::error::{DetectorError, Result};

/// How an image reached its archive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArchiveOutcome {
    /// Destination is a hard link to the scratch file.
    Linked,
    /// Destination is a byte copy.
    Copied,
    /// An identical destination already existed.
    AlreadyPresent,
}

/// Put `source` at `destination`, creating missing directories.
///
/// An existing destination with different content is replaced.
pub fn link_or_copy(source: &Path, destination: &Path) -> Result<ArchiveOutcome> {
    if destination.exists() {
        if same_content(source, destination)? {
            return Ok(ArchiveOutcome::AlreadyPresent);
        }
        tracing::warn!(
            file = %destination.display(),
            "archive file differs from scratch image, replacing"
        );
        fs::remove_file(destination).map_err(|e| DetectorError::io(destination, e))?;
    }

    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| DetectorError::io(parent, e))?;

    match fs::hard_link(source, destination) {
        Ok(()) => Ok(ArchiveOutcome::Linked),
        Err(e) => {
            tracing::debug!(
                source = %source.display(),
                error = %e,
                "hard link failed, copying"
            );
            copy_preserving_mtime(source, destination)?;
            Ok(ArchiveOutcome::Copied)
        }
    }
}

fn copy_preserving_mtime(source: &Path, destination: &Path) -> Result<()> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let mut input = File::open(source).map_err(|e| DetectorError::io(source, e))?;
    let modified = input
        .metadata()
        .and_then(|m| m.modified())
        .map_err(|e| DetectorError::io(source, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| DetectorError::io(parent, e))?;
    io::copy(&mut input, temp.as_file_mut()).map_err(|e| DetectorError::io(destination, e))?;
    temp.as_file()
        .set_modified(modified)
        .map_err(|e| DetectorError::io(destination, e))?;
    temp.persist(destination)
        .map_err(|e| DetectorError::io(destination, e.error))?;
    Ok(())
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::metadata(a).map_err(|e| DetectorError::io(a, e))?;
    let meta_b = fs::metadata(b).map_err(|e| DetectorError::io(b, e))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino() {
            return Ok(true);
        }
    }

    let mut file_a = File::open(a).map_err(|e| DetectorError::io(a, e))?;
    let mut file_b = File::open(b).map_err(|e| DetectorError::io(b, e))?;
    let mut buf_a = [0u8; 64 * 1024];
    let mut buf_b = [0u8; 64 * 1024];
    loop {
        let n = file_a.read(&mut buf_a).map_err(|e| DetectorError::io(a, e))?;
        if n == 0 {
            return Ok(true);
        }
        file_b
            .read_exact(&mut buf_b[..n])
            .map_err(|e| DetectorError::io(b, e))?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_link_then_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scratch/0000001.rx");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"image").unwrap();
        let destination = dir.path().join("data/xray_images/a_000001.rx");

        assert_eq!(link_or_copy(&source, &destination).unwrap(), ArchiveOutcome::Linked);
        assert_eq!(fs::read(&destination).unwrap(), b"image");
        assert_eq!(
            link_or_copy(&source, &destination).unwrap(),
            ArchiveOutcome::AlreadyPresent
        );
    }

    #[test]
    #[traced_test]
    fn test_different_destination_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("0000002.rx");
        let destination = dir.path().join("a_000002.rx");
        fs::write(&source, b"new").unwrap();
        fs::write(&destination, b"old!").unwrap();

        link_or_copy(&source, &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"new");
        assert!(logs_contain("archive file differs from scratch image, replacing"));
    }

    #[test]
    fn test_copy_keeps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("0000003.rx");
        fs::write(&source, b"pixels").unwrap();
        let stamp = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(stamp)
            .unwrap();

        let destination = dir.path().join("copy/a_000003.rx");
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        copy_preserving_mtime(&source, &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"pixels");
        assert_eq!(fs::metadata(&destination).unwrap().modified().unwrap(), stamp);
        assert!(same_content(&source, &destination).unwrap());
    }
}
