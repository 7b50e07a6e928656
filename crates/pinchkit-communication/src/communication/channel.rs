//! Command channel
//!
//! Line-oriented writes and reads over the shared connection. Writes fail
//! fast while disconnected; reads never block longer than the transport's
//! read timeout.

use super::manager::SharedConnection;
use pinchkit_core::{ConnectionError, RoutineCommand, ServoCommand};

/// Upper bound on lines discarded by one `drain`
const MAX_DRAIN_LINES: usize = 64;

/// Sends commands to and reads replies from the controller
#[derive(Clone)]
pub struct CommandChannel {
    connection: SharedConnection,
}

impl CommandChannel {
    /// Create a channel over the shared connection
    pub fn new(connection: SharedConnection) -> Self {
        Self { connection }
    }

    /// The connection this channel writes to
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// Whether the link is currently up
    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_connected()
    }

    /// Write a routine command; false when disconnected or the write fails
    pub fn send(&self, command: &RoutineCommand) -> bool {
        self.write_line(&command.encode())
    }

    /// Write a manual servo command
    pub fn send_servo(&self, command: &ServoCommand) -> bool {
        self.write_line(&command.encode())
    }

    fn write_line(&self, line: &str) -> bool {
        let mut connection = self.connection.lock();
        let Some(transport) = connection.transport_mut() else {
            tracing::debug!("Dropping {:?}: controller not connected", line.trim_end());
            return false;
        };
        let result = transport.write_all(line.as_bytes());
        match result {
            Ok(()) => {
                tracing::debug!("-> {}", line.trim_end());
                true
            }
            Err(e) => {
                tracing::warn!("Write to {} failed: {}", transport.name(), e);
                connection.report_fault(&ConnectionError::WriteFailed {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Read one reply line if one is waiting
    ///
    /// `Ok(None)` means nothing is pending. A missing link is reported as
    /// `NotConnected` and a transport fault as `ReadFailed`.
    pub fn try_receive_line(&self) -> Result<Option<String>, ConnectionError> {
        let mut connection = self.connection.lock();
        let transport = connection
            .transport_mut()
            .ok_or(ConnectionError::NotConnected)?;

        let read = transport.bytes_to_read().and_then(|waiting| {
            if waiting == 0 {
                Ok(Vec::new())
            } else {
                transport.read_line()
            }
        });
        let raw = match read {
            Ok(raw) => raw,
            Err(e) => {
                let error = ConnectionError::ReadFailed {
                    reason: e.to_string(),
                };
                connection.report_fault(&error);
                return Err(error);
            }
        };
        if raw.is_empty() {
            return Ok(None);
        }
        let line = decode_line(&raw);
        tracing::debug!("<- {}", line);
        Ok(Some(line))
    }

    /// Read one reply line; nothing when idle, disconnected or faulted
    pub fn receive_line(&self) -> Option<String> {
        self.try_receive_line().ok().flatten()
    }

    /// Discard stale input; returns the number of lines dropped
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while dropped < MAX_DRAIN_LINES {
            match self.try_receive_line() {
                Ok(Some(line)) => {
                    tracing::trace!("drained {:?}", line);
                    dropped += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("drain stopped: {}", e);
                    break;
                }
            }
        }
        dropped
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Decode a raw reply: invalid UTF-8 is dropped, trailing whitespace trimmed
pub fn decode_line(raw: &[u8]) -> String {
    let mut text = String::with_capacity(raw.len());
    for chunk in raw.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text.truncate(text.trim_end().len());
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::manager::{ConnectionManager, LinkConfig};
    use crate::communication::virtual_port::VirtualSerialBackend;
    use std::sync::Arc;

    const PORT: &str = "/dev/ttyACM0";

    fn connected_channel(backend: &VirtualSerialBackend) -> CommandChannel {
        backend.plug(PORT, "Arduino Uno");
        let mut mgr = ConnectionManager::new(Arc::new(backend.clone()), LinkConfig::default());
        assert!(mgr.reconcile());
        CommandChannel::new(mgr.into_shared())
    }

    #[test]
    fn test_decode_drops_invalid_bytes() {
        assert_eq!(decode_line(b"Rutina completada\r\n"), "Rutina completada");
        assert_eq!(decode_line(b"Rut\xffina detenida \t\n"), "Rutina detenida");
        assert_eq!(decode_line(b"\xc3\xa1ngulo\n"), "ángulo");
        assert_eq!(decode_line(b"\xfe\xff"), "");
    }

    #[test]
    fn test_send_writes_wire_line() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);

        assert!(channel.send(&RoutineCommand::run(2, 4).unwrap()));
        assert!(channel.send_servo(&ServoCommand::new(pinchkit_core::Servo::Gripper, 30)));
        assert_eq!(backend.written_lines(PORT), vec!["2,4", "S3,30"]);
    }

    #[test]
    fn test_send_while_disconnected_writes_nothing() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        channel.connection().lock().disconnect();

        assert!(!channel.send(&RoutineCommand::stop()));
        assert!(backend.written_lines(PORT).is_empty());
    }

    #[test]
    fn test_send_reports_write_failure() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        backend.set_fail_writes(true);

        assert!(!channel.send(&RoutineCommand::run(1, 1).unwrap()));
        // the link is left for reconcile to judge
        assert!(channel.is_connected());
    }

    #[test]
    fn test_receive_line() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        assert_eq!(channel.receive_line(), None);

        backend.push_line(PORT, "Rutina completada");
        assert_eq!(channel.receive_line().as_deref(), Some("Rutina completada"));
        assert_eq!(channel.receive_line(), None);
    }

    #[test]
    fn test_read_fault_surfaces_in_try_receive() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        backend.push_line(PORT, "noise");
        backend.set_fail_reads(true);

        assert!(matches!(
            channel.try_receive_line(),
            Err(ConnectionError::ReadFailed { .. })
        ));
        assert_eq!(channel.receive_line(), None);
    }

    #[test]
    fn test_link_faults_published() {
        use pinchkit_core::{AppEvent, ErrorSeverity, EventBus, EventBusConfig};

        let backend = VirtualSerialBackend::new();
        backend.plug(PORT, "Arduino Uno");
        let bus = Arc::new(EventBus::with_config(EventBusConfig {
            enable_history: true,
            ..Default::default()
        }));
        let mut mgr = ConnectionManager::new(Arc::new(backend.clone()), LinkConfig::default())
            .with_event_bus(Arc::clone(&bus));
        assert!(mgr.reconcile());
        let channel = CommandChannel::new(mgr.into_shared());

        backend.set_fail_writes(true);
        assert!(!channel.send(&RoutineCommand::run(1, 1).unwrap()));
        backend.set_fail_reads(true);
        assert!(channel.try_receive_line().is_err());
        // a missing link is not a fault
        channel.connection().lock().disconnect();
        assert!(channel.try_receive_line().is_err());

        let faults: Vec<(String, ErrorSeverity)> = bus
            .history()
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::Error(fault) => Some((fault.code().to_string(), fault.severity())),
                _ => None,
            })
            .collect();
        assert_eq!(
            faults,
            vec![
                ("write_failed".to_string(), ErrorSeverity::Error),
                ("read_failed".to_string(), ErrorSeverity::Error),
            ]
        );
    }

    #[test]
    fn test_drain_discards_pending_lines() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        backend.push_line(PORT, "Rutina completada");
        backend.push_line(PORT, "Rutina detenida");

        assert_eq!(channel.drain(), 2);
        assert_eq!(channel.receive_line(), None);
    }

    #[test]
    fn test_drain_is_bounded() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        for i in 0..(MAX_DRAIN_LINES + 10) {
            backend.push_line(PORT, &format!("chatter {}", i));
        }
        assert_eq!(channel.drain(), MAX_DRAIN_LINES);
    }

    #[test]
    fn test_drain_swallows_errors() {
        let backend = VirtualSerialBackend::new();
        let channel = connected_channel(&backend);
        backend.set_fail_reads(true);
        assert_eq!(channel.drain(), 0);
    }
}
