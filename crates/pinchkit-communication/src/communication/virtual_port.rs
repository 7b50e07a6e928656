//! In-process serial ports
//!
//! A [`VirtualSerialBackend`] stands in for the operating system: ports can be
//! plugged and unplugged at will, replies can be queued byte for byte, and a
//! port may carry a [`ControllerScript`] that answers routine commands the
//! way the arm firmware does. Used by `--simulate` and by the test suites.

use super::{ConnectionParams, SerialBackend, SerialPortInfo, SerialTransport};
use parking_lot::Mutex;
use pinchkit_core::{ConnectionError, RoutineCommand};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Firmware behaviour of a simulated controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerScript {
    /// Line sent when a routine finishes
    pub completed: String,
    /// Line sent in answer to a stop request
    pub stopped: String,
    /// Time one repetition of any routine takes
    pub routine_duration: Duration,
}

impl Default for ControllerScript {
    fn default() -> Self {
        Self {
            completed: "Rutina completada".to_string(),
            stopped: "Rutina detenida".to_string(),
            routine_duration: Duration::from_secs(2),
        }
    }
}

impl ControllerScript {
    /// Set how long one repetition takes
    pub fn with_routine_duration(mut self, duration: Duration) -> Self {
        self.routine_duration = duration;
        self
    }
}

#[derive(Debug)]
struct VirtualPort {
    id: u64,
    info: SerialPortInfo,
    script: Option<ControllerScript>,
    inbound: VecDeque<u8>,
    written: Vec<String>,
    completion_due: Option<Instant>,
    open: bool,
}

impl VirtualPort {
    /// Deliver a scripted completion whose time has come
    fn advance(&mut self) {
        let Some(due) = self.completion_due else {
            return;
        };
        if Instant::now() < due {
            return;
        }
        self.completion_due = None;
        if let Some(script) = &self.script {
            let line = format!("{}\r\n", script.completed);
            self.inbound.extend(line.as_bytes());
        }
    }

    fn react(&mut self, line: &str) {
        let Some(script) = self.script.clone() else {
            return;
        };
        let Some(command) = RoutineCommand::parse(line) else {
            return;
        };
        if command.is_stop() {
            self.completion_due = None;
            let reply = format!("{}\r\n", script.stopped);
            self.inbound.extend(reply.as_bytes());
        } else {
            let reps = command.repetitions.max(1);
            self.completion_due = Some(Instant::now() + script.routine_duration * reps);
        }
    }
}

#[derive(Debug, Default)]
struct VirtualBus {
    ports: Vec<VirtualPort>,
    next_id: u64,
    open_count: usize,
    fail_enumeration: bool,
    fail_open: bool,
    fail_writes: bool,
    fail_reads: bool,
    write_latency: Duration,
    read_latency: Duration,
}

impl VirtualBus {
    fn by_name(&mut self, name: &str) -> Option<&mut VirtualPort> {
        self.ports.iter_mut().find(|p| p.info.port_name == name)
    }

    fn by_id(&mut self, id: u64) -> Option<&mut VirtualPort> {
        self.ports.iter_mut().find(|p| p.id == id)
    }
}

/// Simulated serial port backend
#[derive(Debug, Clone, Default)]
pub struct VirtualSerialBackend {
    bus: Arc<Mutex<VirtualBus>>,
}

impl VirtualSerialBackend {
    /// Create a backend with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a port that never answers on its own
    pub fn plug(&self, port_name: &str, description: &str) {
        self.plug_port(SerialPortInfo::new(port_name, description), None);
    }

    /// Plug in a port driven by a controller script
    pub fn plug_controller(&self, port_name: &str, description: &str, script: ControllerScript) {
        self.plug_port(SerialPortInfo::new(port_name, description), Some(script));
    }

    /// Plug in a port with full descriptor details
    pub fn plug_port(&self, info: SerialPortInfo, script: Option<ControllerScript>) {
        let mut bus = self.bus.lock();
        bus.ports.retain(|p| p.info.port_name != info.port_name);
        let id = bus.next_id;
        bus.next_id += 1;
        tracing::debug!("virtual port {} plugged", info.port_name);
        bus.ports.push(VirtualPort {
            id,
            info,
            script,
            inbound: VecDeque::new(),
            written: Vec::new(),
            completion_due: None,
            open: false,
        });
    }

    /// Remove a port; open transports on it start failing
    pub fn unplug(&self, port_name: &str) -> bool {
        let mut bus = self.bus.lock();
        let before = bus.ports.len();
        bus.ports.retain(|p| p.info.port_name != port_name);
        before != bus.ports.len()
    }

    /// Queue raw bytes for the console to read
    pub fn push_reply(&self, port_name: &str, bytes: impl AsRef<[u8]>) {
        if let Some(port) = self.bus.lock().by_name(port_name) {
            port.inbound.extend(bytes.as_ref());
        }
    }

    /// Queue one reply line, CRLF-terminated like the firmware's `println`
    pub fn push_line(&self, port_name: &str, line: &str) {
        self.push_reply(port_name, format!("{}\r\n", line));
    }

    /// Lines written by the console so far, terminators stripped
    pub fn written_lines(&self, port_name: &str) -> Vec<String> {
        self.bus
            .lock()
            .by_name(port_name)
            .map(|p| p.written.clone())
            .unwrap_or_default()
    }

    /// Forget recorded writes
    pub fn clear_written(&self, port_name: &str) {
        if let Some(port) = self.bus.lock().by_name(port_name) {
            port.written.clear();
        }
    }

    /// Whether a transport is currently open on the port
    pub fn is_open(&self, port_name: &str) -> bool {
        self.bus
            .lock()
            .by_name(port_name)
            .is_some_and(|p| p.open)
    }

    /// Successful opens across all ports
    pub fn open_count(&self) -> usize {
        self.bus.lock().open_count
    }

    /// Make port enumeration fail
    pub fn set_fail_enumeration(&self, fail: bool) {
        self.bus.lock().fail_enumeration = fail;
    }

    /// Make opening ports fail
    pub fn set_fail_open(&self, fail: bool) {
        self.bus.lock().fail_open = fail;
    }

    /// Make writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.bus.lock().fail_writes = fail;
    }

    /// Make reads fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.bus.lock().fail_reads = fail;
    }

    /// Block every write for `latency`, like a slow USB adapter
    pub fn set_write_latency(&self, latency: Duration) {
        self.bus.lock().write_latency = latency;
    }

    /// Block every line read for `latency`
    pub fn set_read_latency(&self, latency: Duration) {
        self.bus.lock().read_latency = latency;
    }
}

impl SerialBackend for VirtualSerialBackend {
    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, ConnectionError> {
        let bus = self.bus.lock();
        if bus.fail_enumeration {
            return Err(ConnectionError::EnumerationFailed {
                reason: "simulated enumeration failure".to_string(),
            });
        }
        Ok(bus.ports.iter().map(|p| p.info.clone()).collect())
    }

    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn SerialTransport>, ConnectionError> {
        let mut bus = self.bus.lock();
        if bus.fail_open {
            return Err(ConnectionError::FailedToOpen {
                port: params.port.clone(),
                reason: "simulated open failure".to_string(),
            });
        }
        let port = bus
            .by_name(&params.port)
            .ok_or_else(|| ConnectionError::PortNotFound {
                port: params.port.clone(),
            })?;
        if port.open {
            return Err(ConnectionError::FailedToOpen {
                port: params.port.clone(),
                reason: "port busy".to_string(),
            });
        }
        port.open = true;
        let id = port.id;
        bus.open_count += 1;

        Ok(Box::new(VirtualTransport {
            bus: Arc::clone(&self.bus),
            id,
            name: params.port.clone(),
        }))
    }
}

/// Open handle on a virtual port
struct VirtualTransport {
    bus: Arc<Mutex<VirtualBus>>,
    id: u64,
    name: String,
}

impl VirtualTransport {
    fn with_port<T>(
        &self,
        op: impl FnOnce(&mut VirtualPort, &VirtualFaults) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut bus = self.bus.lock();
        let faults = VirtualFaults {
            writes: bus.fail_writes,
            reads: bus.fail_reads,
        };
        match bus.by_id(self.id) {
            Some(port) => op(port, &faults),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} was unplugged", self.name),
            )),
        }
    }
}

struct VirtualFaults {
    writes: bool,
    reads: bool,
}

fn stall(latency: Duration) {
    if !latency.is_zero() {
        std::thread::sleep(latency);
    }
}

impl SerialTransport for VirtualTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        stall(self.bus.lock().write_latency);
        self.with_port(|port, faults| {
            if faults.writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
            }
            let text = String::from_utf8_lossy(data);
            for line in text.lines() {
                port.written.push(line.to_string());
                port.react(line);
            }
            Ok(())
        })
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.with_port(|port, faults| {
            if faults.reads {
                return Err(io::Error::other("simulated read failure"));
            }
            port.advance();
            Ok(port.inbound.len())
        })
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        stall(self.bus.lock().read_latency);
        self.with_port(|port, faults| {
            if faults.reads {
                return Err(io::Error::other("simulated read failure"));
            }
            port.advance();
            let end = port
                .inbound
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(port.inbound.len());
            Ok(port.inbound.drain(..end).collect())
        })
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        if let Some(port) = self.bus.lock().by_id(self.id) {
            port.open = false;
        }
    }
}
