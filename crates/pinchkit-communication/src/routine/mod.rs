//! Routine protocol
//!
//! [`monitor::RoutineMonitor`] is the synchronous exchange state machine;
//! [`executor::RoutineExecutor`] drives it from a tokio task and hands
//! outcomes back as futures.

pub mod executor;
pub mod monitor;

use std::time::Duration;

pub use executor::{RoutineExecutor, RoutineHandle};
pub use monitor::{Conclusion, ExchangeStatus, PollReport, RoutineMonitor};

/// Reply announcing that a routine finished
pub const DEFAULT_COMPLETED_SENTINEL: &str = "Rutina completada";

/// Reply confirming a stop request
pub const DEFAULT_STOPPED_SENTINEL: &str = "Rutina detenida";

/// Protocol timing and sentinel strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Exact reply meaning "routine completed"
    pub completed_sentinel: String,
    /// Exact reply meaning "routine stopped"
    pub stopped_sentinel: String,
    /// Silence after which a routine is declared timed out
    pub routine_timeout: Duration,
    /// Ceiling for a stop request; `None` waits as long as the routine does
    pub stop_timeout: Option<Duration>,
    /// Delay between two polls of one exchange
    pub poll_interval: Duration,
    /// Minimum time between opening the port and the first command
    pub settle_delay: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            completed_sentinel: DEFAULT_COMPLETED_SENTINEL.to_string(),
            stopped_sentinel: DEFAULT_STOPPED_SENTINEL.to_string(),
            routine_timeout: Duration::from_secs(80),
            stop_timeout: Some(Duration::from_secs(10)),
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(4000),
        }
    }
}
