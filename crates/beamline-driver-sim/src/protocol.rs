//! Line protocol spoken by the simulated instruments.
//!
//! Commands are ASCII lines terminated by `\n` (a trailing `\r` is
//! ignored). Queries are answered with one line; settings are silent.
//!
//! | Command | Reply |
//! |---------|-------|
//! | `*IDN?` | identification string |
//! | `TEMP?` | temperature, `%.3f` |
//! | `SETP?` | set-point, `%.3f` |
//! | `SETP <value>` | none |
//! | `ENAB <0\|1>` | none |
//!
//! A command that cannot be parsed or executed is answered with
//! `ERR <message>`.

use beamline_core::{supervised_loop, ObjectId, ThreadProperty};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SimError};
use crate::serial_emulator::{wait_readable, SimulatorPort};
use crate::simulator::ThermalSimulator;

/// How long one server iteration waits for input.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest accepted command line.
const MAX_LINE: usize = 4096;

/// A parsed command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// `*IDN?`
    Identify,
    /// `TEMP?`
    QueryTemperature,
    /// `SETP?`
    QuerySetPoint,
    /// `SETP <value>`
    SetSetPoint(f64),
    /// `ENAB <0|1>`
    Enable(bool),
}

impl FromStr for Command {
    type Err = SimError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let unrecognized = || SimError::Command(line.to_string());
        let (head, argument) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, Some(rest.trim())),
            None => (line, None),
        };
        match (head.to_ascii_uppercase().as_str(), argument) {
            ("*IDN?", None) => Ok(Command::Identify),
            ("TEMP?", None) => Ok(Command::QueryTemperature),
            ("SETP?", None) => Ok(Command::QuerySetPoint),
            ("SETP", Some(value)) => value
                .parse()
                .map(Command::SetSetPoint)
                .map_err(|_| unrecognized()),
            ("ENAB", Some("0")) => Ok(Command::Enable(false)),
            ("ENAB", Some("1")) => Ok(Command::Enable(true)),
            _ => Err(unrecognized()),
        }
    }
}

/// Execute `command` on `simulator`, returning the reply line if any.
pub fn execute(simulator: &ThermalSimulator, command: Command) -> Result<Option<String>> {
    Ok(match command {
        Command::Identify => Some(simulator.identity().to_string()),
        Command::QueryTemperature => Some(format!("{:.3}", simulator.temperature())),
        Command::QuerySetPoint => Some(format!("{:.3}", simulator.set_point())),
        Command::SetSetPoint(value) => {
            simulator.set_set_point(value)?;
            None
        }
        Command::Enable(enabled) => {
            simulator.set_enabled(enabled)?;
            None
        }
    })
}

/// Parse and execute one line, turning failures into `ERR` replies.
pub fn handle_line(simulator: &ThermalSimulator, line: &str) -> Option<String> {
    match line.parse().and_then(|command| execute(simulator, command)) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(command = line, error = %e, "rejected simulator command");
            Some(format!("ERR {e}"))
        }
    }
}

struct Connection {
    port: SimulatorPort,
    pending: Vec<u8>,
}

impl Connection {
    fn serve_pending(&mut self, simulator: &ThermalSimulator) -> Result<()> {
        if !wait_readable(&self.port, POLL_TIMEOUT)? {
            return Ok(());
        }
        let mut chunk = [0u8; 256];
        let n = match self.port.read(&mut chunk) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };
        self.pending.extend_from_slice(&chunk[..n]);

        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::trace!(command = line, "simulator command");
            if let Some(reply) = handle_line(simulator, line) {
                self.port.write_all(reply.as_bytes())?;
                self.port.write_all(b"\n")?;
                self.port.flush()?;
            }
        }
        if self.pending.len() > MAX_LINE {
            tracing::warn!(bytes = self.pending.len(), "discarding unterminated input");
            self.pending.clear();
        }
        Ok(())
    }
}

/// Serves a [`ThermalSimulator`] on the simulator end of an emulated port.
///
/// The `serving` thread property runs the read loop.
pub struct LineServer {
    simulator: Arc<ThermalSimulator>,
    serving: Arc<ThreadProperty>,
}

impl std::fmt::Debug for LineServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineServer")
            .field("simulator", &self.simulator)
            .field("serving", &self.serving.running())
            .finish()
    }
}

impl LineServer {
    /// Serve `simulator` on `port`. Nothing runs until [`start`](Self::start).
    pub fn new(simulator: Arc<ThermalSimulator>, port: SimulatorPort) -> Self {
        let owner: ObjectId = simulator.properties().owner().clone();
        let connection = Arc::new(Mutex::new(Connection {
            port,
            pending: Vec::new(),
        }));
        let served = Arc::downgrade(&simulator);
        let task_name = format!("{owner}.serving");
        let serving = Arc::new(ThreadProperty::new(&owner, "serving", move |cancel| {
            supervised_loop(&task_name, cancel, Duration::from_millis(10), || {
                match served.upgrade() {
                    Some(simulator) => connection.lock().serve_pending(&simulator)?,
                    None => {
                        cancel.cancel();
                    }
                }
                Ok(())
            });
        }));
        simulator.properties().register_thread(&serving);
        Self { simulator, serving }
    }

    /// The `serving` thread property.
    pub fn serving(&self) -> &Arc<ThreadProperty> {
        &self.serving
    }

    /// Start answering commands.
    pub fn start(&self) -> Result<()> {
        self.serving.start()?;
        Ok(())
    }

    /// Stop answering and wait for the read loop to exit.
    pub fn stop(&self) {
        self.serving.stop();
        if !self.serving.wait_stopped(POLL_TIMEOUT * 5) {
            tracing::warn!(object = %self.simulator.properties().owner(), "line server still running");
        }
    }
}

impl Drop for LineServer {
    fn drop(&mut self) {
        self.serving.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedChiller, SimulatorConfig};
    use tracing_test::traced_test;

    #[test]
    fn test_parse() {
        assert_eq!("*IDN?".parse::<Command>().unwrap(), Command::Identify);
        assert_eq!(" temp?\r".parse::<Command>().unwrap(), Command::QueryTemperature);
        assert_eq!(
            "SETP 4.5".parse::<Command>().unwrap(),
            Command::SetSetPoint(4.5)
        );
        assert_eq!("ENAB 0".parse::<Command>().unwrap(), Command::Enable(false));
        assert!("ENAB 2".parse::<Command>().is_err());
        assert!("SETP warm".parse::<Command>().is_err());
        assert!("TEMP? 3".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    #[traced_test]
    fn test_handle_line() {
        let chiller = SimulatedChiller::new("chiller", &SimulatorConfig::default()).unwrap();
        let sim = chiller.simulator();
        assert_eq!(
            handle_line(sim, "*IDN?").as_deref(),
            Some(SimulatedChiller::IDENTITY)
        );
        assert_eq!(handle_line(sim, "SETP 12.25"), None);
        assert_eq!(handle_line(sim, "SETP?").as_deref(), Some("12.250"));
        assert_eq!(handle_line(sim, "TEMP?").as_deref(), Some("22.000"));
        assert_eq!(handle_line(sim, "ENAB 0"), None);
        assert!(!sim.enabled());

        let out_of_range = handle_line(sim, "SETP 900").unwrap();
        assert!(out_of_range.starts_with("ERR "));
        assert_eq!(sim.set_point(), 12.25);
        assert!(handle_line(sim, "RESET").unwrap().starts_with("ERR "));
        assert!(logs_contain("rejected simulator command"));
    }
}
