//! Error types for the acquisition coordinator.

use beamline_core::BeamlineError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for coordinator results.
pub type Result<T> = std::result::Result<T, DetectorError>;

/// Errors raised while polling, correlating and archiving detector images.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// Filesystem operation on a scratch or archive file failed.
    ///
    /// **Recovery Strategy**: the file is retried on the next poll.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The image header could not be decoded, usually a partial write.
    #[error("Cannot read acquire timestamp from '{}': {message}", path.display())]
    Header {
        /// Image file
        path: PathBuf,
        /// What was wrong
        message: String,
    },

    /// Two scratch files correlate to one trigger pulse.
    #[error("'{file}' and image {winner} both belong to trigger count {trigger_count}")]
    DuplicateTrigger {
        /// Scratch file that lost
        file: String,
        /// Image number that keeps the trigger
        winner: u64,
        /// Snapped trigger count
        trigger_count: i64,
    },

    /// An assignment would break strictly increasing archive numbering.
    #[error("'{file}' maps to archive index {index}, not after {previous}")]
    NonIncreasing {
        /// Scratch file
        file: String,
        /// Rejected archive index
        index: i64,
        /// Last archive index of the dataset
        previous: i64,
    },

    /// The coordinator configuration is unusable.
    #[error("Invalid coordinator configuration: {0}")]
    Config(String),

    /// Commanding the detector through its properties failed.
    #[error(transparent)]
    Property(#[from] BeamlineError),
}

impl DetectorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
