//! Where archived images go.
//!
//! Dataset naming conventions belong to the experiment software; the
//! coordinator only needs "archive index -> path".

use std::path::{Path, PathBuf};

/// Maps a 0-based archive index to an archival path.
pub trait AcquisitionLayout: Send + Sync {
    /// Path of the image with archive index `index`.
    fn xray_image_filename(&self, index: u64) -> PathBuf;
}

/// `<directory>/xray_images/<basename>_<index+1, zero padded>.<extension>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    directory: PathBuf,
    basename: String,
    extension: String,
    digits: usize,
}

impl DatasetLayout {
    /// Layout of one dataset. Image numbers are padded to 6 digits.
    pub fn new(
        directory: impl Into<PathBuf>,
        basename: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            basename: basename.into(),
            extension: extension.into(),
            digits: 6,
        }
    }

    /// Override the image number width.
    #[must_use]
    pub fn with_digits(mut self, digits: usize) -> Self {
        self.digits = digits;
        self
    }

    /// Dataset directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl AcquisitionLayout for DatasetLayout {
    fn xray_image_filename(&self, index: u64) -> PathBuf {
        let number = index.saturating_add(1);
        self.directory.join("xray_images").join(format!(
            "{}_{:0width$}.{}",
            self.basename,
            number,
            self.extension,
            width = self.digits
        ))
    }
}
