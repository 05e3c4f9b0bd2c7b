//! Driver-side view of the emulated serial ports.
#![cfg(unix)]

use beamline_driver_sim::{
    discover_emulated_ports, EmulatedPortPair, LineServer, SimulatedTemperatureController,
    SimulatorConfig,
};
use nix::fcntl::OFlag;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn open_driver_end(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .unwrap()
}

#[test]
fn bytes_pass_through_untranslated() {
    let mut pair = EmulatedPortPair::open().unwrap();
    let mut driver = open_driver_end(pair.driver_path());

    pair.write_all(b"*IDN?\n").unwrap();
    let mut received = [0u8; 6];
    driver.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"*IDN?\n");

    // CR, NUL, ^C and 0xFF survive the other direction too
    let payload = b"22.5\r\n\x00\x03\xff";
    driver.write_all(payload).unwrap();
    let mut echoed = [0u8; 9];
    pair.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, payload);
}

#[cfg(target_os = "linux")]
#[test]
fn open_pairs_are_discoverable() {
    let pair = EmulatedPortPair::open().unwrap();
    let path = pair.driver_path().to_string_lossy().into_owned();
    assert!(discover_emulated_ports().contains(&path));
}

fn query(reader: &mut BufReader<File>, command: &str) -> String {
    reader.get_mut().write_all(command.as_bytes()).unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line
}

#[test]
fn driver_talks_to_simulated_controller() {
    let controller =
        SimulatedTemperatureController::new("temperature", &SimulatorConfig::default()).unwrap();
    let pair = EmulatedPortPair::open().unwrap();
    let server = LineServer::new(
        Arc::clone(controller.simulator()),
        pair.simulator_port().unwrap(),
    );
    server.start().unwrap();

    let mut driver = BufReader::new(open_driver_end(pair.driver_path()));
    assert_eq!(
        query(&mut driver, "*IDN?\n"),
        format!("{}\n", SimulatedTemperatureController::IDENTITY)
    );

    // Settings are silent; the following query shows they were applied in order
    driver.get_mut().write_all(b"SETP 4.5\r\nENAB 0\n").unwrap();
    assert_eq!(query(&mut driver, "SETP?\n"), "4.500\n");
    assert!(!controller.simulator().enabled());

    assert!(query(&mut driver, "SETP 1000\n").starts_with("ERR "));
    assert!(query(&mut driver, "HELP\n").starts_with("ERR "));
    assert_eq!(controller.simulator().set_point(), 4.5);

    server.stop();
    assert!(!server.serving().running());
    assert!(server.serving().wait_stopped(Duration::from_secs(1)));
}
