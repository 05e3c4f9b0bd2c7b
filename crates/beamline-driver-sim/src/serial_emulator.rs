//! Emulated serial port pairs.
//!
//! A simulated instrument owns one end of the pair; the driver under test
//! opens the other end by path, exactly as it would open real hardware.
//!
//! On Unix the pair is a pseudo-terminal whose line discipline is switched
//! to raw mode, so bytes pass through without canonicalization, echo,
//! signal mapping or CR/LF translation. On Windows the pair is a
//! preinstalled com0com `CNCAn`/`CNCBn` port pair.

use serialport::{SerialPortInfo, SerialPortType};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(windows)]
use crate::error::SimError;
use crate::error::Result;

/// The simulator's end of an emulated port.
#[cfg(unix)]
pub type SimulatorPort = std::fs::File;

/// The simulator's end of an emulated port.
#[cfg(windows)]
pub type SimulatorPort = Box<dyn serialport::SerialPort>;

/// Read timeout used when the simulator end is a real serial device.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// True for ports created by the com0com null-modem emulator.
pub fn is_com0com(info: &SerialPortInfo) -> bool {
    let name = info.port_name.to_ascii_uppercase();
    if name.starts_with("CNCA") || name.starts_with("CNCB") {
        return true;
    }
    match &info.port_type {
        SerialPortType::UsbPort(usb) => [&usb.product, &usb.manufacturer]
            .into_iter()
            .flatten()
            .any(|text| text.to_ascii_lowercase().contains("com0com")),
        _ => false,
    }
}

/// A connected pair of emulated serial ports.
pub struct EmulatedPortPair {
    simulator: SimulatorPort,
    driver_path: PathBuf,
    // Held open so the line settings survive while no driver is attached
    #[cfg(unix)]
    _driver_end: std::os::fd::OwnedFd,
}

impl std::fmt::Debug for EmulatedPortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedPortPair")
            .field("driver_path", &self.driver_path)
            .finish()
    }
}

impl EmulatedPortPair {
    /// Create a new raw pseudo-terminal pair.
    #[cfg(unix)]
    pub fn open() -> Result<Self> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

        let pty = nix::pty::openpty(None, None)?;
        let mut termios = tcgetattr(&pty.slave)?;
        cfmakeraw(&mut termios);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;
        let driver_path = nix::unistd::ttyname(&pty.slave)?;
        tracing::debug!(path = %driver_path.display(), "opened emulated serial port");

        Ok(Self {
            simulator: std::fs::File::from(pty.master),
            driver_path,
            _driver_end: pty.slave,
        })
    }

    /// Open the first installed com0com pair.
    #[cfg(windows)]
    pub fn open() -> Result<Self> {
        let ports = serialport::available_ports()
            .map_err(|e| SimError::NoPortPair(format!("cannot enumerate serial ports: {e}")))?;
        let names: Vec<String> = ports
            .iter()
            .filter(|p| is_com0com(p))
            .map(|p| p.port_name.clone())
            .collect();
        let (simulator_name, driver_name) = names
            .iter()
            .filter_map(|a| {
                let index = a.to_ascii_uppercase().strip_prefix("CNCA")?.to_string();
                names
                    .iter()
                    .find(|b| b.to_ascii_uppercase() == format!("CNCB{index}"))
                    .map(|b| (a.clone(), b.clone()))
            })
            .next()
            .ok_or_else(|| {
                SimError::NoPortPair(format!(
                    "install com0com; emulated ports found: {}",
                    if names.is_empty() {
                        "none".to_string()
                    } else {
                        names.join(", ")
                    }
                ))
            })?;
        let simulator = serialport::new(simulator_name.as_str(), 115_200)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| SimError::NoPortPair(format!("cannot open {simulator_name}: {e}")))?;
        tracing::debug!(simulator = %simulator_name, driver = %driver_name, "opened com0com pair");
        Ok(Self {
            simulator,
            driver_path: PathBuf::from(driver_name),
        })
    }

    /// Path the driver opens.
    pub fn driver_path(&self) -> &Path {
        &self.driver_path
    }

    /// An independent handle on the simulator end.
    pub fn simulator_port(&self) -> Result<SimulatorPort> {
        Ok(self.simulator.try_clone()?)
    }
}

impl Read for EmulatedPortPair {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.simulator.read(buf)
    }
}

impl Write for EmulatedPortPair {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.simulator.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.simulator.flush()
    }
}

/// Wait up to `timeout` for the simulator end to become readable.
#[cfg(unix)]
pub(crate) fn wait_readable(port: &SimulatorPort, timeout: Duration) -> Result<bool> {
    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsFd;

    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(port.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(ready) => Ok(ready > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Serial ports have a read timeout; let the read itself wait.
#[cfg(windows)]
pub(crate) fn wait_readable(_port: &SimulatorPort, _timeout: Duration) -> Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn is_raw(termios: &nix::sys::termios::Termios) -> bool {
    use nix::sys::termios::{LocalFlags, OutputFlags};

    !termios
        .local_flags
        .intersects(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG)
        && !termios.output_flags.contains(OutputFlags::OPOST)
}

#[cfg(unix)]
fn pty_candidates() -> Vec<PathBuf> {
    let numbered = |name: &str| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit());
    let mut candidates = Vec::new();
    // Linux pty slaves
    if let Ok(entries) = std::fs::read_dir("/dev/pts") {
        candidates.extend(
            entries
                .flatten()
                .filter(|e| numbered(&e.file_name().to_string_lossy()))
                .map(|e| e.path()),
        );
    }
    // BSD and macOS pty slaves
    if let Ok(entries) = std::fs::read_dir("/dev") {
        candidates.extend(
            entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .strip_prefix("ttys")
                        .is_some_and(numbered)
                })
                .map(|e| e.path()),
        );
    }
    candidates.sort();
    candidates
}

/// Paths of existing emulated ports the driver side may open.
///
/// On Unix these are pseudo-terminals whose line discipline is raw. On
/// Windows these are com0com ports.
#[cfg(unix)]
pub fn discover_emulated_ports() -> Vec<String> {
    use nix::fcntl::OFlag;
    use nix::sys::termios::tcgetattr;
    use std::os::unix::fs::OpenOptionsExt;

    pty_candidates()
        .into_iter()
        .filter(|path| {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
                .open(path);
            match file {
                Ok(file) => tcgetattr(&file).map(|t| is_raw(&t)).unwrap_or(false),
                Err(_) => false,
            }
        })
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

/// Paths of existing emulated ports the driver side may open.
///
/// On Unix these are pseudo-terminals whose line discipline is raw. On
/// Windows these are com0com ports.
#[cfg(windows)]
pub fn discover_emulated_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .filter(is_com0com)
            .map(|p| p.port_name)
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "could not enumerate serial ports");
            Vec::new()
        }
    }
}
