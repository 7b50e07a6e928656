//! Data models for the controller link and the routine protocol
//!
//! This module provides:
//! - Link status and the connection state machine
//! - Routine commands and their wire encoding
//! - Manual servo commands for the four joints of the arm
//! - Terminal routine outcomes
//! - The catalog entry describing a pre-programmed routine

use crate::error::RoutineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Link status as seen by the UI indicator
///
/// Always derived from whether a transport handle is held; never stored on
/// its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    /// No transport handle is open
    Disconnected,
    /// A transport handle is open
    Connected,
}

impl LinkStatus {
    /// Build a status from the "handle is open" predicate
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Connection manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Connection not established or closed
    Disconnected,
    /// Opening the port
    Connecting,
    /// Port open and ready for communication
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Routine id reserved for "stop the running routine"
pub const STOP_ROUTINE_ID: u32 = 0;

/// Request to run a pre-programmed routine on the controller
///
/// Encoded on the wire as `"{routine_id},{repetitions}\n"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutineCommand {
    /// Routine number; `0` means stop
    pub routine_id: u32,
    /// How many times the controller repeats the routine
    pub repetitions: u32,
}

impl RoutineCommand {
    /// Create a run request for a routine
    ///
    /// Routine 0 is reserved; use [`RoutineCommand::stop`] instead.
    pub fn run(routine_id: u32, repetitions: u32) -> Result<Self, RoutineError> {
        if routine_id == STOP_ROUTINE_ID {
            return Err(RoutineError::InvalidCommand {
                reason: "routine 0 is reserved for stop".to_string(),
            });
        }
        Ok(Self {
            routine_id,
            repetitions,
        })
    }

    /// The stop request (`0,0`)
    pub const fn stop() -> Self {
        Self {
            routine_id: STOP_ROUTINE_ID,
            repetitions: 0,
        }
    }

    /// Whether this is the stop request
    pub fn is_stop(&self) -> bool {
        self.routine_id == STOP_ROUTINE_ID
    }

    /// Encode as a wire line, newline included
    pub fn encode(&self) -> String {
        // stop never carries repetitions
        let repetitions = if self.is_stop() { 0 } else { self.repetitions };
        format!("{},{}\n", self.routine_id, repetitions)
    }

    /// Decode a wire line produced by [`RoutineCommand::encode`]
    pub fn parse(line: &str) -> Option<Self> {
        let (id, reps) = line.trim().split_once(',')?;
        let routine_id = id.trim().parse().ok()?;
        let repetitions = reps.trim().parse().ok()?;
        Some(Self {
            routine_id,
            repetitions,
        })
    }
}

impl fmt::Display for RoutineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_stop() {
            write!(f, "stop")
        } else {
            write!(f, "routine {} x{}", self.routine_id, self.repetitions)
        }
    }
}

/// Joints of the arm that can be driven manually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Servo {
    /// Rotating base
    Base,
    /// Shoulder / first segment
    Arm,
    /// Elbow / second segment
    Elbow,
    /// Pinch gripper
    Gripper,
}

impl Servo {
    /// All servos in panel order
    pub const ALL: [Servo; 4] = [Servo::Base, Servo::Arm, Servo::Elbow, Servo::Gripper];

    /// Controller channel number used on the wire
    pub fn channel(&self) -> u8 {
        match self {
            Self::Arm => 1,
            Self::Elbow => 2,
            Self::Gripper => 3,
            Self::Base => 4,
        }
    }

    /// Mechanically safe angle range in degrees (inclusive)
    pub fn angle_range(&self) -> (u16, u16) {
        match self {
            Self::Base => (0, 180),
            Self::Arm => (130, 170),
            Self::Elbow => (110, 150),
            Self::Gripper => (0, 180),
        }
    }

    /// Resting angle shown when the manual panel opens
    pub fn home_angle(&self) -> u16 {
        match self {
            Self::Base => 90,
            Self::Arm => 140,
            Self::Elbow => 110,
            Self::Gripper => 90,
        }
    }

    /// Parse a servo name as typed by the operator
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "base" => Some(Self::Base),
            "arm" | "shoulder" => Some(Self::Arm),
            "elbow" => Some(Self::Elbow),
            "gripper" | "pinch" => Some(Self::Gripper),
            _ => None,
        }
    }
}

impl fmt::Display for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Arm => write!(f, "arm"),
            Self::Elbow => write!(f, "elbow"),
            Self::Gripper => write!(f, "gripper"),
        }
    }
}

/// Manual positioning request for one servo
///
/// Encoded on the wire as `"S{channel},{angle}\n"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoCommand {
    /// Target servo
    pub servo: Servo,
    /// Target angle in degrees, always inside the servo's range
    pub angle: u16,
}

impl ServoCommand {
    /// Create a command, clamping the angle into the servo's range
    pub fn new(servo: Servo, angle: u16) -> Self {
        let (min, max) = servo.angle_range();
        Self {
            servo,
            angle: angle.clamp(min, max),
        }
    }

    /// Encode as a wire line, newline included
    pub fn encode(&self) -> String {
        format!("S{},{}\n", self.servo.channel(), self.angle)
    }
}

/// Terminal result of one routine exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutineOutcome {
    /// Controller reported the routine finished
    Completed,
    /// Controller confirmed the routine was stopped
    Stopped,
    /// No conclusive reply within the ceiling
    TimedOut,
    /// The link failed while sending or waiting
    CommunicationError(String),
}

impl RoutineOutcome {
    /// Outcomes the operator should be notified about with a notice
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::TimedOut | Self::CommunicationError(_))
    }
}

impl fmt::Display for RoutineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Stopped => write!(f, "Stopped"),
            Self::TimedOut => write!(f, "Timed out"),
            Self::CommunicationError(detail) => write!(f, "Communication error: {}", detail),
        }
    }
}

/// Catalog entry for a routine programmed into the controller firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDefinition {
    /// Routine number sent on the wire
    pub id: u32,
    /// Short name for menus
    pub name: String,
    /// What the arm does
    pub description: String,
}

impl RoutineDefinition {
    /// Create a catalog entry
    pub fn new(id: u32, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
        }
    }

    /// Routines shipped with the stock controller firmware
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                1,
                "Gripper test",
                "Lower the shoulder, close and open the gripper, raise the shoulder",
            ),
            Self::new(
                2,
                "Unstack",
                "Move to the stack, open the gripper, take the top element",
            ),
            Self::new(
                3,
                "Stack",
                "Take an element, carry it to the stack, place it on top",
            ),
            Self::new(
                4,
                "Arc",
                "Trace an arc/square, closing the gripper going down and opening it going up",
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_routine_command_encoding() {
        let cmd = RoutineCommand::run(1, 3).unwrap();
        assert_eq!(cmd.encode(), "1,3\n");
        assert_eq!(RoutineCommand::stop().encode(), "0,0\n");
    }

    #[test]
    fn test_stop_ignores_repetitions() {
        let cmd = RoutineCommand {
            routine_id: 0,
            repetitions: 4,
        };
        assert!(cmd.is_stop());
        assert_eq!(cmd.encode(), "0,0\n");
    }

    #[test]
    fn test_run_rejects_reserved_id() {
        assert!(matches!(
            RoutineCommand::run(0, 1),
            Err(RoutineError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_parse_wire_line() {
        let cmd = RoutineCommand::run(2, 4).unwrap();
        assert_eq!(RoutineCommand::parse(&cmd.encode()), Some(cmd));
        assert_eq!(RoutineCommand::parse("Rutina completada"), None);
        assert_eq!(RoutineCommand::parse("1,"), None);
        assert_eq!(RoutineCommand::parse("-1,2"), None);
    }

    proptest! {
        #[test]
        fn prop_wire_line_decodes_to_same_command(id in 1u32..1000, reps in 0u32..100) {
            let cmd = RoutineCommand::run(id, reps).unwrap();
            prop_assert_eq!(RoutineCommand::parse(&cmd.encode()), Some(cmd));
        }
    }

    #[test]
    fn test_servo_command_clamps_angle() {
        let cmd = ServoCommand::new(Servo::Arm, 90);
        assert_eq!(cmd.angle, 130);
        assert_eq!(cmd.encode(), "S1,130\n");

        let cmd = ServoCommand::new(Servo::Elbow, 200);
        assert_eq!(cmd.angle, 150);

        let cmd = ServoCommand::new(Servo::Base, 45);
        assert_eq!(cmd.encode(), "S4,45\n");
    }

    #[test]
    fn test_servo_names() {
        assert_eq!(Servo::from_name("Gripper"), Some(Servo::Gripper));
        assert_eq!(Servo::from_name(" shoulder "), Some(Servo::Arm));
        assert_eq!(Servo::from_name("wrist"), None);
        for servo in Servo::ALL {
            assert_eq!(Servo::from_name(&servo.to_string()), Some(servo));
            let (min, max) = servo.angle_range();
            assert!((min..=max).contains(&servo.home_angle()));
        }
    }

    #[test]
    fn test_outcome_attention() {
        assert!(!RoutineOutcome::Completed.needs_attention());
        assert!(!RoutineOutcome::Stopped.needs_attention());
        assert!(RoutineOutcome::TimedOut.needs_attention());
        assert!(RoutineOutcome::CommunicationError("x".into()).needs_attention());
    }

    #[test]
    fn test_default_catalog() {
        let routines = RoutineDefinition::defaults();
        assert_eq!(routines.len(), 4);
        assert!(routines.iter().all(|r| r.id != STOP_ROUTINE_ID));
    }
}
