//! Error types for bus publishing.

use beamline_core::BeamlineError;
use thiserror::Error;

/// Errors raised by [`crate::Ioc`] and [`crate::ControlBus`] implementations.
#[derive(Error, Debug)]
pub enum IocError {
    /// A client wrote to a name nobody serves.
    #[error("No writer registered for '{0}'")]
    UnknownName(String),

    /// The local property refused an external write.
    ///
    /// **Recovery Strategy**: the bus reports the rejection to the client;
    /// the published value stays unchanged.
    #[error("Write to '{name}' rejected: {source}")]
    WriteRejected {
        /// Bus name that was written
        name: String,
        /// Why the property refused it
        #[source]
        source: BeamlineError,
    },

    /// The IOC configuration is unusable.
    #[error("Invalid IOC configuration: {0}")]
    Config(String),

    /// Reading a published property failed at start-up.
    #[error(transparent)]
    Property(#[from] BeamlineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_rejected_names_the_pv() {
        let err = IocError::WriteRejected {
            name: "NIH:CHILLER.TEMPERATURE".into(),
            source: BeamlineError::ReadOnly("chiller.temperature".into()),
        };
        let text = err.to_string();
        assert!(text.contains("NIH:CHILLER.TEMPERATURE"));
        assert!(text.contains("read-only"));
    }
}
