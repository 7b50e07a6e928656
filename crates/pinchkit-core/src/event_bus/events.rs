//! Event type definitions for the event bus.
//!
//! Events are grouped by category and are cloneable and serializable so a
//! front end can log or forward them.

use serde::{Deserialize, Serialize};

use crate::data::{RoutineCommand, RoutineOutcome, ServoCommand};
use crate::error::ConnectionError;

/// Root event enum for all application events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// Controller link events
    Connection(ConnectionEvent),
    /// Routine exchange events
    Routine(RoutineEvent),
    /// Error and diagnostic events
    Error(ErrorEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Routine(_) => EventCategory::Routine,
            AppEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Routine(e) => e.description(),
            AppEvent::Error(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Controller link events.
    Connection,
    /// Routine exchange events.
    Routine,
    /// Error and diagnostic events.
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Routine => write!(f, "Routine"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Operator or shutdown requested it
    UserRequested,
    /// The port vanished from the system port list
    DeviceRemoved,
    /// A new connection attempt replaced the old handle
    Reconnecting,
}

/// Controller link events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A candidate controller port was found.
    DeviceDetected {
        /// Serial port path of the candidate.
        port: String,
    },
    /// Starting connection attempt.
    Connecting {
        /// Serial port path being connected to.
        port: String,
    },
    /// Successfully connected.
    Connected {
        /// Serial port path that was connected.
        port: String,
    },
    /// Disconnected from device.
    Disconnected {
        /// Serial port path that was disconnected.
        port: String,
        /// Reason for the disconnection.
        reason: DisconnectReason,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Serial port path that failed to connect.
        port: String,
        /// Error message describing the failure.
        error: String,
    },
    /// Status indicator changed after a reconcile.
    StatusChanged {
        /// Whether the device is currently connected.
        connected: bool,
        /// Remembered device path, if any.
        port: Option<String>,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::DeviceDetected { port } => format!("Controller detected on {}", port),
            ConnectionEvent::Connecting { port } => format!("Connecting to {}", port),
            ConnectionEvent::Connected { port } => format!("Connected to {}", port),
            ConnectionEvent::Disconnected { port, reason } => {
                format!("Disconnected from {}: {:?}", port, reason)
            }
            ConnectionEvent::ConnectionFailed { port, error } => {
                format!("Connection failed to {}: {}", port, error)
            }
            ConnectionEvent::StatusChanged { connected, port } => match (connected, port) {
                (true, Some(port)) => format!("Connection state: connected on {}", port),
                (true, None) => "Connection state: connected".to_string(),
                (false, _) => "Connection state: disconnected".to_string(),
            },
        }
    }
}

/// Routine exchange events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoutineEvent {
    /// A routine command was written and is awaiting its reply.
    Started {
        /// The command that was sent.
        command: RoutineCommand,
    },
    /// A stop request was written.
    StopRequested,
    /// The exchange reached a terminal outcome.
    Finished {
        /// The command the outcome belongs to.
        command: RoutineCommand,
        /// The terminal outcome.
        outcome: RoutineOutcome,
    },
    /// A manual servo command was written.
    ServoMoved {
        /// The command that was sent.
        command: ServoCommand,
    },
}

impl RoutineEvent {
    fn description(&self) -> String {
        match self {
            RoutineEvent::Started { command } => format!("Started {}", command),
            RoutineEvent::StopRequested => "Stop requested".to_string(),
            RoutineEvent::Finished { command, outcome } => {
                format!("Finished {}: {}", command, outcome)
            }
            RoutineEvent::ServoMoved { command } => {
                format!("Servo {} -> {}°", command.servo, command.angle)
            }
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Non-blocking warning.
    Warning,
    /// Error the operator should see.
    Error,
}

/// Error and diagnostic events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// Warning (non-blocking).
    Warning {
        /// Warning code identifier.
        code: String,
        /// Human-readable warning message.
        message: String,
    },
    /// Error (may be recoverable).
    Error {
        /// Error code identifier.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Whether recovery is possible without user intervention.
        recoverable: bool,
    },
}

impl ErrorEvent {
    /// Event for a fault on the controller link
    ///
    /// Open failures are warnings since the next reconcile retries them;
    /// read and write faults interrupt whatever the operator was doing.
    pub fn link_fault(error: &ConnectionError) -> Self {
        let message = error.to_string();
        match error {
            ConnectionError::PortNotFound { .. } => Self::Warning {
                code: "port_not_found".to_string(),
                message,
            },
            ConnectionError::FailedToOpen { .. } => Self::Warning {
                code: "open_failed".to_string(),
                message,
            },
            ConnectionError::EnumerationFailed { .. } => Self::Warning {
                code: "enumeration_failed".to_string(),
                message,
            },
            ConnectionError::NotConnected => Self::Warning {
                code: "not_connected".to_string(),
                message,
            },
            ConnectionError::WriteFailed { .. } => Self::Error {
                code: "write_failed".to_string(),
                message,
                recoverable: true,
            },
            ConnectionError::ReadFailed { .. } => Self::Error {
                code: "read_failed".to_string(),
                message,
                recoverable: true,
            },
            ConnectionError::InvalidParameters { .. } => Self::Error {
                code: "invalid_parameters".to_string(),
                message,
                recoverable: false,
            },
        }
    }

    /// Machine-readable code
    pub fn code(&self) -> &str {
        match self {
            ErrorEvent::Warning { code, .. } | ErrorEvent::Error { code, .. } => code,
        }
    }

    fn description(&self) -> String {
        match self {
            ErrorEvent::Warning { code, message } => {
                format!("Warning [{}]: {}", code, message)
            }
            ErrorEvent::Error { code, message, .. } => {
                format!("Error [{}]: {}", code, message)
            }
        }
    }

    /// Get the severity level of this event
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorEvent::Warning { .. } => ErrorSeverity::Warning,
            ErrorEvent::Error { .. } => ErrorSeverity::Error,
        }
    }
}
