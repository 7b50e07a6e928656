//! Async routine executor
//!
//! Wraps a [`RoutineMonitor`] in a lock, sends commands on behalf of the
//! front end, and runs a driver task that polls the exchange on a fixed
//! interval until it concludes. Outcomes come back through
//! [`RoutineHandle`], a future over a oneshot channel.

use super::monitor::{ExchangeStatus, PollReport, RoutineMonitor};
use super::ProtocolConfig;
use crate::communication::channel::CommandChannel;
use crate::communication::manager::SharedConnection;
use parking_lot::Mutex;
use pinchkit_core::{
    AppEvent, EventBus, RoutineCommand, RoutineError, RoutineEvent, RoutineOutcome, Servo,
    ServoCommand,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const SHUTDOWN_DETAIL: &str = "console shutting down";

/// Pending outcome of a routine or stop request
///
/// Resolves exactly once. If the executor goes away without answering, the
/// handle resolves to a communication error. An outcome seen through
/// [`RoutineHandle::try_outcome`] is kept, so the handle can still be awaited.
#[derive(Debug)]
pub struct RoutineHandle {
    command: RoutineCommand,
    receiver: Option<oneshot::Receiver<RoutineOutcome>>,
    outcome: Option<RoutineOutcome>,
}

impl RoutineHandle {
    fn new(command: RoutineCommand) -> (oneshot::Sender<RoutineOutcome>, Self) {
        let (sender, receiver) = oneshot::channel();
        let handle = Self {
            command,
            receiver: Some(receiver),
            outcome: None,
        };
        (sender, handle)
    }

    /// The command this handle tracks
    pub fn command(&self) -> RoutineCommand {
        self.command
    }

    /// The outcome, if it is already known
    pub fn try_outcome(&mut self) -> Option<RoutineOutcome> {
        if let Some(receiver) = self.receiver.as_mut() {
            let received = match receiver.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => None,
            };
            self.settle(received);
        }
        self.outcome.clone()
    }

    /// Record the final outcome; the receiver must not be polled again
    fn settle(&mut self, received: Option<RoutineOutcome>) -> RoutineOutcome {
        self.receiver = None;
        let outcome = received.unwrap_or_else(executor_dropped);
        self.outcome = Some(outcome.clone());
        outcome
    }
}

fn executor_dropped() -> RoutineOutcome {
    RoutineOutcome::CommunicationError("routine executor dropped".to_string())
}

impl Future for RoutineHandle {
    type Output = RoutineOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let received = match this.receiver.as_mut() {
            Some(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(result) => result.ok(),
                Poll::Pending => return Poll::Pending,
            },
            None => return Poll::Ready(this.outcome.clone().unwrap_or_else(executor_dropped)),
        };
        Poll::Ready(this.settle(received))
    }
}

struct ExecutorState {
    monitor: RoutineMonitor,
    routine_waiter: Option<oneshot::Sender<RoutineOutcome>>,
    stop_waiters: Vec<oneshot::Sender<RoutineOutcome>>,
    driver: Option<JoinHandle<()>>,
    starting: Option<RoutineCommand>,
    shut_down: bool,
}

impl ExecutorState {
    fn ensure_available(&self) -> Result<(), RoutineError> {
        if self.shut_down {
            return Err(RoutineError::ShutDown);
        }
        match self.monitor.current_command().or(self.starting) {
            Some(command) => Err(RoutineError::Busy {
                routine_id: command.routine_id,
            }),
            None => Ok(()),
        }
    }

    fn deliver(&mut self, report: PollReport, events: &Events) {
        if let Some(outcome) = report.stop {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }
        if let Some(conclusion) = report.routine {
            events.emit(RoutineEvent::Finished {
                command: conclusion.command,
                outcome: conclusion.outcome.clone(),
            });
            if let Some(waiter) = self.routine_waiter.take() {
                let _ = waiter.send(conclusion.outcome);
            }
        }
    }
}

#[derive(Clone, Default)]
struct Events(Option<Arc<EventBus>>);

impl Events {
    fn emit(&self, event: RoutineEvent) {
        if let Some(bus) = &self.0 {
            bus.emit(AppEvent::Routine(event));
        }
    }
}

struct Inner {
    channel: CommandChannel,
    config: ProtocolConfig,
    state: Mutex<ExecutorState>,
    events: Events,
}

/// Front-end surface for running, stopping and jogging the arm
#[derive(Clone)]
pub struct RoutineExecutor {
    inner: Arc<Inner>,
}

impl RoutineExecutor {
    /// Create an executor over the shared connection
    pub fn new(connection: SharedConnection, config: ProtocolConfig) -> Self {
        Self::build(connection, config, None)
    }

    /// Create an executor that publishes routine events on `bus`
    pub fn with_event_bus(
        connection: SharedConnection,
        config: ProtocolConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::build(connection, config, Some(bus))
    }

    fn build(
        connection: SharedConnection,
        config: ProtocolConfig,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let channel = CommandChannel::new(connection);
        let monitor = RoutineMonitor::new(channel.clone(), config.clone());
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                state: Mutex::new(ExecutorState {
                    monitor,
                    routine_waiter: None,
                    stop_waiters: Vec::new(),
                    driver: None,
                    starting: None,
                    shut_down: false,
                }),
                events: Events(bus),
            }),
        }
    }

    /// Send a routine and return a handle to its outcome
    ///
    /// Errors only when the request cannot be made at all (another routine
    /// in flight, malformed command, shut down). A failed write still
    /// returns a handle, already resolved to a communication error. When the
    /// port was opened less than the settle delay ago, the send waits for
    /// the controller to finish booting.
    pub async fn start_routine(
        &self,
        routine_id: u32,
        repetitions: u32,
    ) -> Result<RoutineHandle, RoutineError> {
        let command = RoutineCommand::run(routine_id, repetitions)?;
        let _reservation = Reservation::claim(&self.inner, command)?;

        if let Some(deadline) = self.settle_deadline() {
            if deadline > Instant::now() {
                tracing::info!("Waiting for the controller to settle before {}", command);
                tokio::time::sleep_until(deadline).await;
            }
        }

        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(RoutineError::ShutDown);
        }

        let (sender, handle) = RoutineHandle::new(command);
        match state.monitor.start(command)? {
            ExchangeStatus::Concluded(outcome) => {
                self.inner.events.emit(RoutineEvent::Finished {
                    command,
                    outcome: outcome.clone(),
                });
                let _ = sender.send(outcome);
            }
            ExchangeStatus::Awaiting => {
                self.inner.events.emit(RoutineEvent::Started { command });
                state.routine_waiter = Some(sender);
                if state.driver.is_none() {
                    state.driver = Some(tokio::spawn(drive(Arc::clone(&self.inner))));
                }
            }
        }
        Ok(handle)
    }

    /// Ask the controller to stop the routine in flight
    ///
    /// Returns `None` and writes nothing when no routine is running.
    pub fn stop_routine(&self) -> Option<RoutineHandle> {
        let mut state = self.inner.state.lock();
        let status = state.monitor.request_stop(Instant::now())?;
        self.inner.events.emit(RoutineEvent::StopRequested);

        let (sender, handle) = RoutineHandle::new(RoutineCommand::stop());
        match status {
            ExchangeStatus::Concluded(outcome) => {
                let _ = sender.send(outcome);
            }
            ExchangeStatus::Awaiting => state.stop_waiters.push(sender),
        }
        Some(handle)
    }

    /// Drive one servo to an angle (clamped to its range)
    ///
    /// Refused while a routine is running.
    pub fn move_servo(&self, servo: Servo, angle: u16) -> Result<ServoCommand, RoutineError> {
        let state = self.inner.state.lock();
        state.ensure_available()?;

        let command = ServoCommand::new(servo, angle);
        if !self.inner.channel.send_servo(&command) {
            return Err(RoutineError::SendFailed);
        }
        self.inner.events.emit(RoutineEvent::ServoMoved { command });
        Ok(command)
    }

    /// Whether a routine is in flight or about to be sent
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().ensure_available().is_err()
    }

    /// The routine currently awaiting its reply
    pub fn current_routine(&self) -> Option<RoutineCommand> {
        self.inner.state.lock().monitor.current_command()
    }

    /// Protocol settings
    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// The command channel
    pub fn channel(&self) -> &CommandChannel {
        &self.inner.channel
    }

    /// Cancel polling and resolve every pending handle
    ///
    /// A routine still in flight gets a best-effort stop command first.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        if let Some(command) = state.monitor.reset() {
            tracing::info!("Stopping {} before shutdown", command);
            if !self.inner.channel.send(&RoutineCommand::stop()) {
                tracing::debug!("Stop on shutdown was not delivered");
            }
        }

        let outcome = RoutineOutcome::CommunicationError(SHUTDOWN_DETAIL.to_string());
        if let Some(waiter) = state.routine_waiter.take() {
            let _ = waiter.send(outcome.clone());
        }
        for waiter in state.stop_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn settle_deadline(&self) -> Option<Instant> {
        let connected_at = self.inner.channel.connection().lock().connected_at()?;
        Some(connected_at + self.inner.config.settle_delay)
    }
}

impl std::fmt::Debug for RoutineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineExecutor")
            .field("current_routine", &self.current_routine())
            .finish()
    }
}

/// Marks a routine as starting while the settle delay runs
struct Reservation<'a> {
    inner: &'a Inner,
}

impl<'a> Reservation<'a> {
    fn claim(inner: &'a Inner, command: RoutineCommand) -> Result<Self, RoutineError> {
        let mut state = inner.state.lock();
        state.ensure_available()?;
        state.starting = Some(command);
        Ok(Self { inner })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().starting = None;
    }
}

/// Poll the exchange until it concludes
async fn drive(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; the command was just sent
    ticker.tick().await;

    loop {
        ticker.tick().await;

        // a read may block for the transport timeout
        let step = Arc::clone(&inner);
        match tokio::task::spawn_blocking(move || poll_once(&step)).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("Routine poll failed: {}", e);
                inner.state.lock().driver = None;
                return;
            }
        }
    }
}

/// One poll step; false once nothing is left to wait for
fn poll_once(inner: &Inner) -> bool {
    let mut state = inner.state.lock();
    let report = state.monitor.poll(Instant::now());
    if !report.is_empty() {
        state.deliver(report, &inner.events);
    }
    if state.monitor.is_awaiting() {
        return true;
    }
    state.driver = None;
    false
}
