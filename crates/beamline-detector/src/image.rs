//! Reading the detector's own timestamp from an image file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{DetectorError, Result};

/// Extracts the hardware acquire timestamp from an image file.
pub trait ImageDecoder: Send + Sync {
    /// Seconds since the Unix epoch on the detector's clock.
    fn acquire_timestamp(&self, path: &Path) -> Result<f64>;
}

/// Byte offset of the timestamp in the default header layout.
pub const DEFAULT_TIMESTAMP_OFFSET: u64 = 1024;

/// Reads one little-endian `f64` at a fixed header offset.
#[derive(Debug, Clone, Copy)]
pub struct HeaderTimestampDecoder {
    offset: u64,
}

impl Default for HeaderTimestampDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_OFFSET)
    }
}

impl HeaderTimestampDecoder {
    /// Decoder for a timestamp stored at `offset`.
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Header offset in bytes.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl ImageDecoder for HeaderTimestampDecoder {
    fn acquire_timestamp(&self, path: &Path) -> Result<f64> {
        let mut file = File::open(path).map_err(|e| DetectorError::io(path, e))?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| DetectorError::io(path, e))?;
        let mut bytes = [0u8; 8];
        file.read_exact(&mut bytes).map_err(|e| DetectorError::Header {
            path: path.to_path_buf(),
            message: format!("header shorter than {} bytes: {e}", self.offset + 8),
        })?;
        let timestamp = f64::from_le_bytes(bytes);
        if !timestamp.is_finite() || timestamp <= 0.0 {
            return Err(DetectorError::Header {
                path: path.to_path_buf(),
                message: format!("implausible timestamp {timestamp}"),
            });
        }
        Ok(timestamp)
    }
}

/// Write a header-only image carrying `timestamp` at `offset`.
///
/// Used by the simulated detector and by tests.
pub fn write_header_image(path: &Path, offset: u64, timestamp: f64) -> Result<()> {
    let size = usize::try_from(offset).map_err(|_| DetectorError::Header {
        path: path.to_path_buf(),
        message: format!("offset {offset} too large"),
    })?;
    let mut bytes = vec![0u8; size + 8];
    bytes[size..].copy_from_slice(&timestamp.to_le_bytes());
    std::fs::write(path, bytes).map_err(|e| DetectorError::io(path, e))
}
