//! Error type for the simulators and the serial port emulator.

use beamline_core::BeamlineError;
use thiserror::Error;

/// Convenience alias for simulator results.
pub type Result<T> = std::result::Result<T, SimError>;

/// Errors raised while setting up or serving a simulated instrument.
#[derive(Error, Debug)]
pub enum SimError {
    /// The pseudo-terminal pair could not be created or configured.
    #[error("Failed to set up emulated serial port: {0}")]
    Pty(String),

    /// No emulated port pair is installed (com0com on Windows).
    #[error("No emulated serial port pair found: {0}")]
    NoPortPair(String),

    /// Reading or writing the simulator end of the port failed.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A protocol command could not be parsed.
    #[error("Unrecognized command '{0}'")]
    Command(String),

    /// Invalid simulator configuration.
    #[error("Simulator configuration error: {0}")]
    Config(String),

    /// A property write was rejected.
    #[error(transparent)]
    Property(#[from] BeamlineError),
}

#[cfg(unix)]
impl From<nix::Error> for SimError {
    fn from(e: nix::Error) -> Self {
        SimError::Pty(e.to_string())
    }
}
