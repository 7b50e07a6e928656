//! Configuration for the PinchKit console
//!
//! Provides configuration file handling and validation. Supports JSON and
//! TOML file formats.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (baud rate, read timeout, port markers, settle delay)
//! - Protocol settings (sentinels, timeouts, poll cadence)
//! - Console settings (status refresh, repetition bound, routine catalog)

use crate::error::{ConfigError, SettingsError, SettingsResult};
use pinchkit_core::{RoutineDefinition, STOP_ROUTINE_ID};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Baud rate for the controller port
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
    /// Case-insensitive fragments of the port description that mark the
    /// controller
    pub port_markers: Vec<String>,
    /// Minimum wait between opening the port and the first routine, in
    /// milliseconds; the board resets when the port opens
    pub settle_delay_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            timeout_ms: 1000,
            port_markers: vec![
                "arduino".to_string(),
                "usb serial".to_string(),
                "dispositivo serie".to_string(),
            ],
            settle_delay_ms: 4000,
        }
    }
}

impl ConnectionSettings {
    /// Read timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Settle delay
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Routine protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Exact reply meaning "routine completed"
    pub completed_sentinel: String,
    /// Exact reply meaning "routine stopped"
    pub stopped_sentinel: String,
    /// Ceiling for one routine, in seconds
    pub routine_timeout_secs: u64,
    /// Ceiling for a stop confirmation, in seconds; 0 disables it
    pub stop_timeout_secs: u64,
    /// Poll cadence while a routine runs, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            completed_sentinel: "Rutina completada".to_string(),
            stopped_sentinel: "Rutina detenida".to_string(),
            routine_timeout_secs: 80,
            stop_timeout_secs: 10,
            poll_interval_ms: 100,
        }
    }
}

impl ProtocolSettings {
    /// Routine ceiling
    pub fn routine_timeout(&self) -> Duration {
        Duration::from_secs(self.routine_timeout_secs)
    }

    /// Stop ceiling
    pub fn stop_timeout(&self) -> Option<Duration> {
        (self.stop_timeout_secs > 0).then(|| Duration::from_secs(self.stop_timeout_secs))
    }

    /// Poll cadence
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Operator console settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Status refresh / reconcile cadence in milliseconds
    pub reconcile_interval_ms: u64,
    /// Largest repetition count the operator may request
    pub max_repetitions: u32,
    /// Routines offered to the operator
    pub routines: Vec<RoutineDefinition>,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 1000,
            max_repetitions: 5,
            routines: RoutineDefinition::defaults(),
        }
    }
}

impl ConsoleSettings {
    /// Reconcile cadence
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Look up a routine by id
    pub fn routine(&self, id: u32) -> Option<&RoutineDefinition> {
        self.routines.iter().find(|r| r.id == id)
    }

    /// Whether the operator may request this many repetitions
    pub fn repetitions_allowed(&self, repetitions: u32) -> bool {
        repetitions <= self.max_repetitions
    }
}

/// Complete console configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Serial link settings
    pub connection: ConnectionSettings,
    /// Routine protocol settings
    pub protocol: ProtocolSettings,
    /// Operator console settings
    pub console: ConsoleSettings,
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("toml") => Ok(Format::Toml),
        other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("<none>").to_string()).into()),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    ///
    /// Missing keys fall back to their defaults.
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => {
                toml::to_string_pretty(self).map_err(|e| SettingsError::SaveError(e.to_string()))?
            }
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        let connection = &self.connection;
        if connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }
        if connection.timeout_ms == 0 {
            return Err(SettingsError::invalid("connection.timeout_ms", "must be > 0"));
        }
        if connection.port_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(SettingsError::invalid(
                "connection.port_markers",
                "at least one non-blank marker is required",
            ));
        }

        let protocol = &self.protocol;
        if protocol.completed_sentinel.trim().is_empty() {
            return Err(SettingsError::invalid("protocol.completed_sentinel", "must not be blank"));
        }
        if protocol.stopped_sentinel.trim().is_empty() {
            return Err(SettingsError::invalid("protocol.stopped_sentinel", "must not be blank"));
        }
        if protocol.completed_sentinel == protocol.stopped_sentinel {
            return Err(SettingsError::invalid(
                "protocol.stopped_sentinel",
                "must differ from the completed sentinel",
            ));
        }
        if protocol.routine_timeout_secs == 0 {
            return Err(SettingsError::invalid("protocol.routine_timeout_secs", "must be > 0"));
        }
        if protocol.poll_interval_ms == 0
            || protocol.poll_interval() >= protocol.routine_timeout()
        {
            return Err(ConfigError::ValueOutOfRange {
                key: "protocol.poll_interval_ms".to_string(),
                value: protocol.poll_interval_ms.to_string(),
            }
            .into());
        }

        let console = &self.console;
        if console.reconcile_interval_ms == 0 {
            return Err(SettingsError::invalid("console.reconcile_interval_ms", "must be > 0"));
        }
        if console.max_repetitions == 0 || console.max_repetitions > 99 {
            return Err(ConfigError::ValueOutOfRange {
                key: "console.max_repetitions".to_string(),
                value: console.max_repetitions.to_string(),
            }
            .into());
        }
        let mut seen = HashSet::new();
        for routine in &console.routines {
            if routine.id == STOP_ROUTINE_ID {
                return Err(SettingsError::invalid(
                    "console.routines",
                    "routine 0 is reserved for stop",
                ));
            }
            if !seen.insert(routine.id) {
                return Err(SettingsError::invalid(
                    "console.routines",
                    format!("duplicate routine id {}", routine.id),
                ));
            }
        }

        Ok(())
    }
}
