//! # PinchKit Communication
//!
//! Serial link to the arm controller and the routine protocol on top of it.
//! Covers port discovery, the self-healing connection manager, the line
//! command channel, routine exchanges with their timeouts, and a virtual
//! backend that simulates the controller firmware.

pub mod communication;
pub mod routine;

pub use communication::{
    channel::{decode_line, CommandChannel},
    manager::{ConnectionManager, LinkConfig, SharedConnection},
    scanner::{PortScanner, DEFAULT_PORT_MARKERS},
    serial::{list_ports, RealSerialPort, SerialPortInfo, SystemSerialBackend},
    supervisor::{LinkSnapshot, LinkSupervisor, DEFAULT_RECONCILE_INTERVAL},
    virtual_port::{ControllerScript, VirtualSerialBackend},
    ConnectionParams, SerialBackend, SerialTransport, SharedBackend, DEFAULT_BAUD_RATE,
    DEFAULT_IO_TIMEOUT,
};

pub use routine::{
    Conclusion, ExchangeStatus, PollReport, ProtocolConfig, RoutineExecutor, RoutineHandle,
    RoutineMonitor, DEFAULT_COMPLETED_SENTINEL, DEFAULT_STOPPED_SENTINEL,
};
