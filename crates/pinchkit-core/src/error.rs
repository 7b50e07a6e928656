//! Error handling for PinchKit
//!
//! Provides the error types shared by every layer of the console:
//! - Connection errors (port discovery, open, read/write on the serial link)
//! - Routine errors (rejected or undeliverable routine requests)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents failures of the serial link to the arm controller. These never
/// cross the core/UI boundary as panics; the connection manager and command
/// channel convert them into status changes, `false` results and
/// [`ErrorEvent`](crate::event_bus::ErrorEvent)s.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Operation attempted while the link is down
    #[error("Controller not connected")]
    NotConnected,

    /// Writing to the port failed
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason the write failed.
        reason: String,
    },

    /// Reading from the port failed
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// The reason the read failed.
        reason: String,
    },

    /// Serial port enumeration failed
    #[error("Failed to enumerate ports: {reason}")]
    EnumerationFailed {
        /// The reason enumeration failed.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Routine error type
///
/// Raised when a routine or servo request cannot even be started. A request
/// that was started always ends in a `RoutineOutcome` instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutineError {
    /// Another routine is still awaiting its reply
    #[error("Routine {routine_id} is still running")]
    Busy {
        /// The id of the routine currently in flight.
        routine_id: u32,
    },

    /// The request is malformed (e.g. routine 0 with repetitions)
    #[error("Invalid routine command: {reason}")]
    InvalidCommand {
        /// Why the command was rejected.
        reason: String,
    },

    /// The command could not be written to the controller
    #[error("Failed to send command to controller")]
    SendFailed,

    /// The executor has been shut down
    #[error("Routine executor is shut down")]
    ShutDown,
}
