//! # PinchKit Core
//!
//! Core types, errors, and events shared by the PinchKit crates: the link
//! state model, routine and servo commands with their wire encoding,
//! routine outcomes, and the event bus.

pub mod data;
pub mod error;
pub mod event_bus;

pub use data::{
    ConnectionState, LinkStatus, RoutineCommand, RoutineDefinition, RoutineOutcome, Servo,
    ServoCommand, STOP_ROUTINE_ID,
};

pub use error::{ConnectionError, RoutineError};

pub use event_bus::{
    AppEvent, ConnectionEvent, DisconnectReason, ErrorEvent, ErrorSeverity, EventBus,
    EventBusConfig, EventCategory, EventFilter, RoutineEvent, SubscriptionId,
};
