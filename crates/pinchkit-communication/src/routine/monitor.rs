//! Routine exchange state machine
//!
//! `Idle -> Awaiting -> {Completed | Stopped | TimedOut | CommunicationError}`
//!
//! The monitor never sleeps or spawns. The routine clock starts once the
//! command has been written; polls and stop requests take the current
//! instant from the caller, which keeps the timing contract testable.

use super::ProtocolConfig;
use crate::communication::channel::CommandChannel;
use pinchkit_core::{ConnectionError, RoutineCommand, RoutineError, RoutineOutcome};
use tokio::time::Instant;

/// Result of starting an exchange or requesting a stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Command written; waiting for a sentinel
    Awaiting,
    /// Finished without waiting (e.g. the write failed)
    Concluded(RoutineOutcome),
}

/// A routine exchange that reached its terminal outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conclusion {
    /// The routine command the outcome belongs to
    pub command: RoutineCommand,
    /// Terminal outcome
    pub outcome: RoutineOutcome,
}

/// What changed during one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Set when the routine exchange concluded
    pub routine: Option<Conclusion>,
    /// Set when a pending stop request resolved
    pub stop: Option<RoutineOutcome>,
}

impl PollReport {
    /// Nothing happened
    pub fn is_empty(&self) -> bool {
        self.routine.is_none() && self.stop.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct Exchange {
    command: RoutineCommand,
    started_at: Instant,
    stop_requested_at: Option<Instant>,
}

/// Tracks the single in-flight routine
#[derive(Debug)]
pub struct RoutineMonitor {
    channel: CommandChannel,
    config: ProtocolConfig,
    exchange: Option<Exchange>,
}

impl RoutineMonitor {
    /// Create an idle monitor
    pub fn new(channel: CommandChannel, config: ProtocolConfig) -> Self {
        Self {
            channel,
            config,
            exchange: None,
        }
    }

    /// Start a routine exchange
    ///
    /// Rejected without writing anything while another routine is awaiting.
    /// Stale input is drained before the command goes out.
    pub fn start(&mut self, command: RoutineCommand) -> Result<ExchangeStatus, RoutineError> {
        if command.is_stop() {
            return Err(RoutineError::InvalidCommand {
                reason: "use request_stop to stop a routine".to_string(),
            });
        }
        if let Some(current) = &self.exchange {
            return Err(RoutineError::Busy {
                routine_id: current.command.routine_id,
            });
        }

        let stale = self.channel.drain();
        if stale > 0 {
            tracing::debug!("Discarded {} stale line(s) before {}", stale, command);
        }

        if !self.channel.send(&command) {
            tracing::warn!("Could not send {}", command);
            return Ok(ExchangeStatus::Concluded(RoutineOutcome::CommunicationError(
                "failed to send routine command".to_string(),
            )));
        }

        tracing::info!("Started {}", command);
        self.exchange = Some(Exchange {
            command,
            started_at: Instant::now(),
            stop_requested_at: None,
        });
        Ok(ExchangeStatus::Awaiting)
    }

    /// Ask the controller to stop the running routine
    ///
    /// Returns `None` without writing when nothing is awaiting. The routine
    /// exchange itself keeps running until the controller answers.
    pub fn request_stop(&mut self, now: Instant) -> Option<ExchangeStatus> {
        let exchange = self.exchange.as_mut()?;
        if exchange.stop_requested_at.is_some() {
            return Some(ExchangeStatus::Awaiting);
        }

        if !self.channel.send(&RoutineCommand::stop()) {
            tracing::warn!("Could not send stop for {}", exchange.command);
            return Some(ExchangeStatus::Concluded(RoutineOutcome::CommunicationError(
                "failed to send stop command".to_string(),
            )));
        }

        tracing::info!("Stop requested for {}", exchange.command);
        exchange.stop_requested_at = Some(now);
        Some(ExchangeStatus::Awaiting)
    }

    /// One polling step: read at most one line, then check the ceilings
    pub fn poll(&mut self, now: Instant) -> PollReport {
        let Some(exchange) = self.exchange else {
            return PollReport::default();
        };

        match self.channel.try_receive_line() {
            Ok(Some(line)) if line == self.config.completed_sentinel => {
                return self.conclude(RoutineOutcome::Completed);
            }
            Ok(Some(line)) if line == self.config.stopped_sentinel => {
                return self.conclude(RoutineOutcome::Stopped);
            }
            Ok(Some(line)) => tracing::debug!("Ignoring reply {:?}", line),
            Ok(None) => {}
            Err(e @ (ConnectionError::ReadFailed { .. } | ConnectionError::NotConnected)) => {
                return self.conclude(RoutineOutcome::CommunicationError(e.to_string()));
            }
            Err(e) => tracing::debug!("Unexpected read result: {}", e),
        }

        if now.duration_since(exchange.started_at) > self.config.routine_timeout {
            return self.conclude(RoutineOutcome::TimedOut);
        }

        let mut report = PollReport::default();
        if let (Some(requested), Some(ceiling)) =
            (exchange.stop_requested_at, self.config.stop_timeout)
        {
            if now.duration_since(requested) > ceiling {
                tracing::warn!("No stop confirmation for {} within {:?}", exchange.command, ceiling);
                if let Some(current) = self.exchange.as_mut() {
                    current.stop_requested_at = None;
                }
                report.stop = Some(RoutineOutcome::TimedOut);
            }
        }
        report
    }

    fn conclude(&mut self, outcome: RoutineOutcome) -> PollReport {
        let Some(exchange) = self.exchange.take() else {
            return PollReport::default();
        };
        if outcome.needs_attention() {
            tracing::warn!("{} ended: {}", exchange.command, outcome);
        } else {
            tracing::info!("{} ended: {}", exchange.command, outcome);
        }
        PollReport {
            stop: exchange.stop_requested_at.map(|_| outcome.clone()),
            routine: Some(Conclusion {
                command: exchange.command,
                outcome,
            }),
        }
    }

    /// Whether a routine is in flight
    pub fn is_awaiting(&self) -> bool {
        self.exchange.is_some()
    }

    /// Whether a stop request is waiting for confirmation
    pub fn stop_pending(&self) -> bool {
        self.exchange
            .is_some_and(|e| e.stop_requested_at.is_some())
    }

    /// The routine in flight
    pub fn current_command(&self) -> Option<RoutineCommand> {
        self.exchange.map(|e| e.command)
    }

    /// When the routine in flight was sent
    pub fn started_at(&self) -> Option<Instant> {
        self.exchange.map(|e| e.started_at)
    }

    /// Abandon the exchange without an outcome; returns what was in flight
    pub fn reset(&mut self) -> Option<RoutineCommand> {
        self.exchange.take().map(|e| e.command)
    }

    /// The channel used for the exchange
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Protocol settings
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::manager::{ConnectionManager, LinkConfig};
    use crate::communication::virtual_port::VirtualSerialBackend;
    use std::sync::Arc;
    use std::time::Duration;

    const PORT: &str = "/dev/ttyACM0";

    fn monitor(backend: &VirtualSerialBackend) -> RoutineMonitor {
        backend.plug(PORT, "Arduino Uno");
        let mut mgr = ConnectionManager::new(Arc::new(backend.clone()), LinkConfig::default());
        assert!(mgr.reconcile());
        RoutineMonitor::new(
            CommandChannel::new(mgr.into_shared()),
            ProtocolConfig::default(),
        )
    }

    fn run(id: u32, reps: u32) -> RoutineCommand {
        RoutineCommand::run(id, reps).unwrap()
    }

    #[test]
    fn test_completed_sentinel_concludes() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);

        assert_eq!(monitor.start(run(1, 3)), Ok(ExchangeStatus::Awaiting));
        let t0 = monitor.started_at().unwrap();
        assert!(monitor.poll(t0 + Duration::from_millis(100)).is_empty());

        backend.push_line(PORT, "Rutina completada");
        let report = monitor.poll(t0 + Duration::from_millis(200));
        assert_eq!(
            report.routine,
            Some(Conclusion {
                command: run(1, 3),
                outcome: RoutineOutcome::Completed
            })
        );
        assert!(!monitor.is_awaiting());
        assert!(monitor.poll(t0 + Duration::from_millis(300)).is_empty());
    }

    #[test]
    fn test_other_text_is_ignored() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(2, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();

        backend.push_line(PORT, "Rutina completada!");
        backend.push_line(PORT, "Moviendo base");
        assert!(monitor.poll(t0).is_empty());
        assert!(monitor.poll(t0).is_empty());
        assert!(monitor.is_awaiting());
    }

    #[test]
    fn test_timeout_ceiling_is_exclusive() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(4, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();

        assert!(monitor.poll(t0 + Duration::from_secs(80)).is_empty());
        let report = monitor.poll(t0 + Duration::from_secs(80) + Duration::from_millis(1));
        assert_eq!(
            report.routine.map(|c| c.outcome),
            Some(RoutineOutcome::TimedOut)
        );
    }

    #[test]
    fn test_second_start_rejected_without_writing() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(1, 1)).unwrap();

        assert_eq!(
            monitor.start(run(3, 2)),
            Err(RoutineError::Busy { routine_id: 1 })
        );
        assert_eq!(backend.written_lines(PORT), vec!["1,1"]);
    }

    #[test]
    fn test_start_drains_stale_input() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        backend.push_line(PORT, "Rutina completada");

        monitor.start(run(1, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();
        assert!(monitor.poll(t0).is_empty());
        assert!(monitor.is_awaiting());
    }

    #[test]
    fn test_send_failure_concludes_immediately() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        backend.set_fail_writes(true);

        let status = monitor.start(run(1, 1)).unwrap();
        assert!(matches!(
            status,
            ExchangeStatus::Concluded(RoutineOutcome::CommunicationError(_))
        ));
        assert!(!monitor.is_awaiting());
    }

    #[test]
    fn test_read_fault_concludes_with_detail() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(1, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();

        backend.set_fail_reads(true);
        match monitor.poll(t0).routine.map(|c| c.outcome) {
            Some(RoutineOutcome::CommunicationError(detail)) => {
                assert!(detail.contains("simulated read failure"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_link_loss_concludes() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(1, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();

        monitor.channel().connection().lock().disconnect();
        assert!(matches!(
            monitor.poll(t0).routine.map(|c| c.outcome),
            Some(RoutineOutcome::CommunicationError(_))
        ));
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        assert_eq!(monitor.request_stop(Instant::now()), None);
        assert!(backend.written_lines(PORT).is_empty());
    }

    #[test]
    fn test_stop_confirmed() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(3, 5)).unwrap();
        let t0 = monitor.started_at().unwrap();

        assert_eq!(monitor.request_stop(t0), Some(ExchangeStatus::Awaiting));
        // a second request does not write again
        assert_eq!(monitor.request_stop(t0), Some(ExchangeStatus::Awaiting));
        assert_eq!(backend.written_lines(PORT), vec!["3,5", "0,0"]);

        backend.push_line(PORT, "Rutina detenida");
        let report = monitor.poll(t0 + Duration::from_millis(100));
        assert_eq!(report.stop, Some(RoutineOutcome::Stopped));
        assert_eq!(
            report.routine.map(|c| c.outcome),
            Some(RoutineOutcome::Stopped)
        );
    }

    #[test]
    fn test_stop_ceiling_leaves_routine_running() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(1, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();
        monitor.request_stop(t0 + Duration::from_secs(5));

        assert!(monitor.poll(t0 + Duration::from_secs(15)).is_empty());
        let report = monitor.poll(t0 + Duration::from_secs(16));
        assert_eq!(report.stop, Some(RoutineOutcome::TimedOut));
        assert!(report.routine.is_none());
        assert!(monitor.is_awaiting());
        assert!(!monitor.stop_pending());
    }

    #[test]
    fn test_completion_resolves_pending_stop() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        monitor.start(run(1, 1)).unwrap();
        let t0 = monitor.started_at().unwrap();
        monitor.request_stop(t0);

        backend.push_line(PORT, "Rutina completada");
        let report = monitor.poll(t0);
        assert_eq!(report.stop, Some(RoutineOutcome::Completed));
    }

    #[test]
    fn test_clock_starts_after_write() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        backend.set_write_latency(Duration::from_millis(50));

        let requested = Instant::now();
        monitor.start(run(2, 1)).unwrap();
        let started_at = monitor.started_at().unwrap();
        assert!(started_at.duration_since(requested) >= Duration::from_millis(50));

        // the ceiling counts from the write, not from the request
        let deadline = requested + Duration::from_secs(80) + Duration::from_millis(10);
        assert!(monitor.poll(deadline).is_empty());
    }

    #[test]
    fn test_stop_command_cannot_start() {
        let backend = VirtualSerialBackend::new();
        let mut monitor = monitor(&backend);
        assert!(matches!(
            monitor.start(RoutineCommand::stop()),
            Err(RoutineError::InvalidCommand { .. })
        ));
    }
}
