//! Connection manager
//!
//! Owns the remembered controller path and the single open transport.
//! Link status is derived from whether a transport is held; there is no
//! separate flag that could drift from the handle.

use super::scanner::{PortScanner, DEFAULT_PORT_MARKERS};
use super::{
    ConnectionParams, SerialPortInfo, SerialTransport, SharedBackend, DEFAULT_BAUD_RATE,
    DEFAULT_IO_TIMEOUT,
};
use parking_lot::Mutex;
use pinchkit_core::{
    AppEvent, ConnectionError, ConnectionEvent, ConnectionState, DisconnectReason, ErrorEvent,
    EventBus, LinkStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Connection manager shared between the channel, the executor and the
/// supervisor; every transport access goes through this one lock
pub type SharedConnection = Arc<Mutex<ConnectionManager>>;

/// Link settings used by `reconcile` and `connect_default`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout
    pub timeout: Duration,
    /// Port description markers identifying the controller
    pub port_markers: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_IO_TIMEOUT,
            port_markers: DEFAULT_PORT_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Detects, opens and self-heals the link to the controller
pub struct ConnectionManager {
    scanner: PortScanner,
    backend: SharedBackend,
    config: LinkConfig,
    port: Option<String>,
    transport: Option<Box<dyn SerialTransport>>,
    connected_at: Option<Instant>,
    events: Option<Arc<EventBus>>,
}

impl ConnectionManager {
    /// Create a manager; nothing is scanned or opened yet
    pub fn new(backend: SharedBackend, config: LinkConfig) -> Self {
        let scanner = PortScanner::new(Arc::clone(&backend), &config.port_markers);
        Self {
            scanner,
            backend,
            config,
            port: None,
            transport: None,
            connected_at: None,
            events: None,
        }
    }

    /// Publish link transitions on `bus`
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Wrap in the shared lock
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    /// Scan for the controller and remember its path
    ///
    /// Returns true when a candidate is present. When none is found, a
    /// previously remembered path is forgotten and any open handle released.
    pub fn detect(&mut self) -> bool {
        let ports = self.scanner.scan();
        self.select_candidate(&ports)
    }

    /// Open the remembered port
    ///
    /// Any previous handle is released first. Failures are logged and leave
    /// the manager disconnected.
    pub fn connect(&mut self, baud_rate: u32, timeout: Duration) -> bool {
        let Some(port) = self.port.clone() else {
            tracing::warn!("Cannot connect: no controller port detected");
            return false;
        };

        self.release(DisconnectReason::Reconnecting);
        self.emit(ConnectionEvent::Connecting { port: port.clone() });

        let params = ConnectionParams::new(&port)
            .with_baud_rate(baud_rate)
            .with_timeout(timeout);
        match self.backend.open(&params) {
            Ok(transport) => {
                tracing::info!("Connected to controller on {} at {} baud", port, baud_rate);
                self.transport = Some(transport);
                self.connected_at = Some(Instant::now());
                self.emit(ConnectionEvent::Connected { port });
                true
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", port, e);
                self.report_fault(&e);
                self.emit(ConnectionEvent::ConnectionFailed {
                    port,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Open the remembered port with the configured baud rate and timeout
    pub fn connect_default(&mut self) -> bool {
        self.connect(self.config.baud_rate, self.config.timeout)
    }

    /// Release the handle; safe to call when already disconnected
    pub fn disconnect(&mut self) {
        self.release(DisconnectReason::UserRequested);
    }

    /// Re-derive the link from the live port list
    ///
    /// Makes at most one open attempt per call and returns `is_connected()`.
    pub fn reconcile(&mut self) -> bool {
        let ports = self.scanner.scan();

        if let Some(port) = self.port.clone() {
            if !ports.iter().any(|p| p.port_name == port) {
                tracing::info!("Controller {} was removed", port);
                self.release(DisconnectReason::DeviceRemoved);
                self.port = None;
                return self.is_connected();
            }
        }

        if self.select_candidate(&ports) {
            if self.transport.is_none() {
                self.connect_default();
            }
        } else {
            self.release(DisconnectReason::DeviceRemoved);
        }

        self.is_connected()
    }

    /// Whether a transport handle is held
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Status for the UI indicator
    pub fn link_status(&self) -> LinkStatus {
        LinkStatus::from_connected(self.is_connected())
    }

    /// Current state; `Connecting` only exists inside `connect`
    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Remembered controller path
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// When the current handle was opened
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    /// Link settings
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Port scanner in use
    pub fn scanner(&self) -> &PortScanner {
        &self.scanner
    }

    /// Every port currently on the system
    pub fn available_ports(&self) -> Vec<SerialPortInfo> {
        self.scanner.scan()
    }

    /// The open transport, if any
    pub fn transport_mut(&mut self) -> Option<&mut (dyn SerialTransport + 'static)> {
        self.transport.as_deref_mut()
    }

    fn select_candidate(&mut self, ports: &[SerialPortInfo]) -> bool {
        // keep the remembered controller while it still qualifies
        if let Some(current) = self.port.as_deref() {
            if ports
                .iter()
                .any(|p| p.port_name == current && self.scanner.is_candidate(p))
            {
                return true;
            }
        }

        match self.scanner.find_candidate(ports) {
            Some(candidate) => {
                let name = candidate.port_name.clone();
                if self.transport.is_some() {
                    self.release(DisconnectReason::Reconnecting);
                }
                tracing::info!("Controller detected on {} ({})", name, candidate.description);
                self.port = Some(name.clone());
                self.emit(ConnectionEvent::DeviceDetected { port: name });
                true
            }
            None => {
                if let Some(port) = self.port.take() {
                    tracing::info!("Controller {} no longer detected", port);
                    self.release(DisconnectReason::DeviceRemoved);
                }
                false
            }
        }
    }

    fn release(&mut self, reason: DisconnectReason) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        let port = transport.name();
        drop(transport);
        self.connected_at = None;
        tracing::info!("Disconnected from {} ({:?})", port, reason);
        self.emit(ConnectionEvent::Disconnected { port, reason });
    }

    /// Publish a link fault on the event bus, if one is attached
    pub fn report_fault(&self, error: &ConnectionError) {
        if let Some(bus) = &self.events {
            bus.emit(AppEvent::Error(ErrorEvent::link_fault(error)));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(bus) = &self.events {
            bus.emit(AppEvent::Connection(event));
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .field("config", &self.config)
            .finish()
    }
}
