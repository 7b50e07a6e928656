//! Serial link layer
//!
//! - [`serial`]: system serial ports through the `serialport` crate
//! - [`virtual_port`]: in-process ports with a scripted controller
//! - [`scanner`]: classifies ports to find the arm controller
//! - [`manager`]: owns the single transport handle and self-heals the link
//! - [`channel`]: writes commands and reads reply lines
//! - [`supervisor`]: periodic reconcile task feeding the status indicator

pub mod channel;
pub mod manager;
pub mod scanner;
pub mod serial;
pub mod supervisor;
pub mod virtual_port;

use pinchkit_core::ConnectionError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use serial::SerialPortInfo;

/// Default controller baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default upper bound for one blocking read
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Parameters for opening a serial transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Device path (e.g. "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout; bounds every blocking read
    pub timeout: Duration,
}

impl ConnectionParams {
    /// Parameters with the default baud rate and timeout
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// An open, line-oriented serial transport
///
/// Dropping the transport closes it.
pub trait SerialTransport: Send {
    /// Write the whole buffer
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Number of bytes waiting to be read, without blocking
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Read one line including its terminator
    ///
    /// Blocks at most for the configured read timeout; on timeout returns
    /// whatever was received so far (possibly nothing).
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Device path of this transport
    fn name(&self) -> String;
}

/// Source of serial ports: enumeration plus opening
pub trait SerialBackend: Send + Sync {
    /// Enumerate the ports currently present on the system
    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, ConnectionError>;

    /// Open a port
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn SerialTransport>, ConnectionError>;
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn SerialBackend>;
