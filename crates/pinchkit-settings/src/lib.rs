//! PinchKit Settings Crate
//!
//! Handles console configuration: link and protocol parameters, the routine
//! catalog, and where the settings file lives.

pub mod config;
pub mod error;
pub mod manager;

pub use config::{Config, ConnectionSettings, ConsoleSettings, ProtocolSettings};
pub use error::{ConfigError, SettingsError, SettingsResult};
pub use manager::SettingsManager;
