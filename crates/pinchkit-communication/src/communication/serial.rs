//! Serial port communication implementation
//!
//! Provides low-level serial port operations for the USB link to the arm
//! controller.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Baud rate and read timeout configuration
//! - Line-oriented reads bounded by the read timeout

use super::{ConnectionParams, SerialBackend, SerialTransport};
use pinchkit_core::ConnectionError;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Longest reply line accepted before a partial line is handed back
const MAX_LINE_LEN: usize = 256;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "Arduino Uno (Arduino (www.arduino.cc))")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

impl std::fmt::Display for SerialPortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.port_name, self.description)?;
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{:04x}:{:04x}]", vid, pid)?;
        }
        Ok(())
    }
}

/// List serial ports on the system
///
/// Every port the OS reports is returned, in OS order; deciding which one
/// is the controller is the scanner's job.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, ConnectionError> {
    match serialport::available_ports() {
        Ok(ports) => Ok(ports
            .iter()
            .map(|port| {
                let info = SerialPortInfo::new(&port.port_name, get_port_description(port));

                match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb_info) => {
                        let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                        if let Some(ref mfg) = usb_info.manufacturer {
                            info = info.with_manufacturer(mfg);
                        }
                        if let Some(ref serial) = usb_info.serial_number {
                            info = info.with_serial_number(serial);
                        }
                        info
                    }
                    _ => info,
                }
            })
            .collect()),
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(ConnectionError::EnumerationFailed {
                reason: e.to_string(),
            })
        }
    }
}

/// Get a user-friendly description for a port
///
/// USB ports report product and manufacturer strings; those are what the
/// controller markers are matched against.
fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            match (usb_info.product.as_deref(), usb_info.manufacturer.as_deref()) {
                (Some(product), Some(mfg)) => format!("{} ({})", product, mfg),
                (Some(product), None) => product.to_string(),
                (None, Some(mfg)) => format!("{} USB Serial Device", mfg),
                (None, None) => "USB Serial Device".to_string(),
            }
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Real serial port implementation using serialport crate
pub struct RealSerialPort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    pending: Vec<u8>,
}

impl RealSerialPort {
    /// Open a serial port with the given parameters (8N1, no flow control)
    pub fn open(params: &ConnectionParams) -> Result<Self, ConnectionError> {
        if params.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be > 0".to_string(),
            });
        }

        let builder = serialport::new(&params.port, params.baud_rate)
            .timeout(params.timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(port) => Ok(RealSerialPort {
                port,
                name: params.port.clone(),
                pending: Vec::new(),
            }),
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                Err(match e.kind() {
                    serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                        port: params.port.clone(),
                    },
                    _ => ConnectionError::FailedToOpen {
                        port: params.port.clone(),
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }
}

impl SerialTransport for RealSerialPort {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::from)?;
        Ok(self.pending.len() + waiting as usize)
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; 64];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if self.pending.len() >= MAX_LINE_LEN {
                return Ok(std::mem::take(&mut self.pending));
            }
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(std::mem::take(&mut self.pending)),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Ok(std::mem::take(&mut self.pending))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Backend over the operating system's serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerialBackend;

impl SerialBackend for SystemSerialBackend {
    fn list_ports(&self) -> Result<Vec<SerialPortInfo>, ConnectionError> {
        list_ports()
    }

    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn SerialTransport>, ConnectionError> {
        Ok(Box::new(RealSerialPort::open(params)?))
    }
}
