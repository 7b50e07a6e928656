//! # PinchKit
//!
//! Operator console for a serial-controlled pinch-gripper robotic arm.
//!
//! ## Architecture
//!
//! PinchKit is organized as a workspace with multiple crates:
//!
//! 1. **pinchkit-core** - Link state, routine and servo commands, outcomes, events
//! 2. **pinchkit-communication** - Port scanning, connection management,
//!    the command channel and the routine executor
//! 3. **pinchkit-settings** - Configuration file and validation
//! 4. **pinchkit** - The headless console binary that integrates all crates
//!
//! The controller is detected by its port description, opened at 9600 baud,
//! and driven with `"{routine},{repetitions}"` lines. Each routine waits for
//! a conclusive reply ("Rutina completada" / "Rutina detenida") or times out
//! after 80 seconds.

pub mod console;

pub use console::{
    link_config, protocol_config, simulated_backend, ConsoleCommand, Flow, OperatorConsole,
    SIMULATED_PORT,
};

pub use pinchkit_core::{
    AppEvent, ConnectionError, ConnectionEvent, ConnectionState, EventBus, LinkStatus,
    RoutineCommand, RoutineDefinition, RoutineError, RoutineEvent, RoutineOutcome, Servo,
    ServoCommand, STOP_ROUTINE_ID,
};

pub use pinchkit_communication::{
    list_ports, CommandChannel, ConnectionManager, LinkConfig, LinkSnapshot, LinkSupervisor,
    PortScanner, ProtocolConfig, RoutineExecutor, RoutineHandle, SerialPortInfo, SharedBackend,
    SharedConnection, SystemSerialBackend, VirtualSerialBackend,
};

pub use pinchkit_settings::{Config, SettingsManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Honors `RUST_LOG` (default `info`). Logs go to stderr so they never mix
/// with console replies on stdout; `json` switches to one JSON object per
/// line for log collectors.
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = json.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .json()
    });
    let pretty_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true)
            .pretty()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))?;

    Ok(())
}
