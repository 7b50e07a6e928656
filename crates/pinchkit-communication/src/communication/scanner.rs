//! Controller port discovery
//!
//! Classifies system serial ports by their OS description. The port list is
//! queried on every call; nothing is cached between scans.

use super::{SerialPortInfo, SharedBackend};

/// Description fragments that identify the controller out of the box
///
/// Covers genuine boards ("Arduino"), common USB-UART bridges
/// ("USB Serial") and the localized Windows driver name.
pub const DEFAULT_PORT_MARKERS: &[&str] = &["arduino", "usb serial", "dispositivo serie"];

/// Finds the arm controller among the system's serial ports
pub struct PortScanner {
    backend: SharedBackend,
    markers: Vec<String>,
}

impl PortScanner {
    /// Create a scanner matching the given description markers
    ///
    /// Markers are compared case-insensitively; blank markers are ignored.
    pub fn new<I, S>(backend: SharedBackend, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let markers = markers
            .into_iter()
            .map(|m| m.as_ref().trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        Self { backend, markers }
    }

    /// Create a scanner with [`DEFAULT_PORT_MARKERS`]
    pub fn with_default_markers(backend: SharedBackend) -> Self {
        Self::new(backend, DEFAULT_PORT_MARKERS.iter().copied())
    }

    /// The normalized markers
    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Enumerate ports; an enumeration failure reads as "no ports"
    pub fn scan(&self) -> Vec<SerialPortInfo> {
        match self.backend.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!("Port scan failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Whether a port plausibly is the controller
    pub fn is_candidate(&self, port: &SerialPortInfo) -> bool {
        let description = port.description.to_lowercase();
        self.markers.iter().any(|m| description.contains(m.as_str()))
    }

    /// First candidate in scan order
    pub fn find_candidate<'a>(&self, ports: &'a [SerialPortInfo]) -> Option<&'a SerialPortInfo> {
        ports.iter().find(|p| self.is_candidate(p))
    }

    /// Scan and return the first candidate
    pub fn scan_for_candidate(&self) -> Option<SerialPortInfo> {
        let ports = self.scan();
        self.find_candidate(&ports).cloned()
    }
}

impl std::fmt::Debug for PortScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortScanner")
            .field("markers", &self.markers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::virtual_port::VirtualSerialBackend;
    use std::sync::Arc;

    fn scanner(backend: &VirtualSerialBackend) -> PortScanner {
        PortScanner::with_default_markers(Arc::new(backend.clone()))
    }

    #[test]
    fn test_markers_are_case_insensitive() {
        let backend = VirtualSerialBackend::new();
        let scanner = PortScanner::new(Arc::new(backend), ["  CH340 ", "", "Arduino"]);
        assert_eq!(scanner.markers(), &["ch340".to_string(), "arduino".to_string()]);

        assert!(scanner.is_candidate(&SerialPortInfo::new("COM3", "USB-SERIAL CH340 (COM3)")));
        assert!(scanner.is_candidate(&SerialPortInfo::new("COM4", "ARDUINO UNO")));
        assert!(!scanner.is_candidate(&SerialPortInfo::new("COM1", "Communications Port")));
    }

    #[test]
    fn test_localized_description_matches() {
        let backend = VirtualSerialBackend::new();
        backend.plug("COM5", "Dispositivo serie USB (COM5)");
        let candidate = scanner(&backend).scan_for_candidate();
        assert_eq!(candidate.map(|p| p.port_name), Some("COM5".to_string()));
    }

    #[test]
    fn test_first_match_in_scan_order_wins() {
        let backend = VirtualSerialBackend::new();
        backend.plug("/dev/ttyS0", "Serial Port");
        backend.plug("/dev/ttyUSB0", "USB Serial");
        backend.plug("/dev/ttyACM0", "Arduino Mega 2560");

        let scanner = scanner(&backend);
        let ports = scanner.scan();
        assert_eq!(ports.len(), 3);
        assert_eq!(
            scanner.find_candidate(&ports).map(|p| p.port_name.as_str()),
            Some("/dev/ttyUSB0")
        );
    }

    #[test]
    fn test_no_cache_between_scans() {
        let backend = VirtualSerialBackend::new();
        let scanner = scanner(&backend);
        assert!(scanner.scan_for_candidate().is_none());

        backend.plug("/dev/ttyACM0", "Arduino Uno");
        assert!(scanner.scan_for_candidate().is_some());

        backend.unplug("/dev/ttyACM0");
        assert!(scanner.scan_for_candidate().is_none());
    }

    #[test]
    fn test_enumeration_failure_reads_as_empty() {
        let backend = VirtualSerialBackend::new();
        backend.plug("/dev/ttyACM0", "Arduino Uno");
        backend.set_fail_enumeration(true);
        assert!(scanner(&backend).scan().is_empty());
    }
}
