//! Error types for the property runtime.
//!
//! `BeamlineError` follows the error taxonomy of the control suite:
//!
//! - **Transient I/O** (`Io`, `Watch`): retried by [`crate::retry`], then
//!   surfaced to readers as a stale/NaN value.
//! - **Parse failures** (`Parse`, `TypeMismatch`): logged by the reader, which
//!   falls back to the declared default.
//! - **Contract violations** (`ReadOnly`, `Validation`, `UnknownProperty`):
//!   returned to the writer, which logs and discards the write.
//!
//! No variant is ever allowed to escape a background loop; see
//! [`crate::run_async::supervised_loop`].

use thiserror::Error;

/// Convenience alias for results using the runtime error type.
pub type Result<T> = std::result::Result<T, BeamlineError>;

/// Primary error type for property access, persistence and eventing.
#[derive(Error, Debug)]
pub enum BeamlineError {
    /// A write was attempted on a property that only its driver may update.
    ///
    /// **Recovery Strategy**: log at error level and discard the write.
    #[error("Property '{0}' is read-only")]
    ReadOnly(String),

    /// The object has no property with the requested name.
    #[error("Object '{object}' has no property '{property}'")]
    UnknownProperty {
        /// Name of the object that was asked
        object: String,
        /// Requested property name
        property: String,
    },

    /// A dynamic value could not be converted to the property's declared type.
    #[error("Property '{property}' expects {expected}, got {value}")]
    TypeMismatch {
        /// Property being written
        property: String,
        /// Declared Rust type of the property
        expected: &'static str,
        /// Literal form of the rejected value
        value: String,
    },

    /// A validator attached to the property rejected the value.
    #[error("Invalid value for '{property}': {message}")]
    Validation {
        /// Property being written
        property: String,
        /// Validator message
        message: String,
    },

    /// A stored literal could not be parsed.
    ///
    /// **Recovery Strategy**: readers log a warning and use the default value.
    #[error("Malformed literal {input:?} at position {position}: {message}")]
    Parse {
        /// Text that failed to parse
        input: String,
        /// Byte offset of the failure
        position: usize,
        /// What the parser expected
        message: String,
    },

    /// A database key that cannot be mapped onto the settings directory.
    #[error("Invalid database key '{0}'")]
    InvalidKey(String),

    /// An alias path could not be followed to its leaf property.
    #[error("Alias '{path}' cannot be resolved at segment '{segment}'")]
    AliasResolution {
        /// Full dotted path
        path: String,
        /// First segment that did not resolve
        segment: String,
    },

    /// A background worker thread could not be spawned.
    #[error("Failed to spawn worker thread '{name}': {source}")]
    Spawn {
        /// Thread name
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Standard I/O operation failed.
    ///
    /// **Error Type**: usually transient (file replaced during a read, disk
    /// busy). Retried by [`crate::retry::with_retry`].
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The OS file watcher could not be created or attached.
    ///
    /// **Recovery Strategy**: fall back to mtime polling only.
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl BeamlineError {
    /// True for errors that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, BeamlineError::Io(_) | BeamlineError::Watch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BeamlineError::ReadOnly("chiller.temperature".into());
        assert_eq!(err.to_string(), "Property 'chiller.temperature' is read-only");

        let err = BeamlineError::UnknownProperty {
            object: "camera".into(),
            property: "gain".into(),
        };
        assert!(err.to_string().contains("gain"));
    }

    #[test]
    fn test_transient_classification() {
        let io = BeamlineError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(io.is_transient());
        assert!(!BeamlineError::InvalidKey("..".into()).is_transient());
    }
}
