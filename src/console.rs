//! Headless operator console
//!
//! Line commands on stdin drive the arm; link status changes and routine
//! outcomes are reported as they happen. The console owns the connection,
//! the reconcile task and the executor, and releases the port on every
//! exit path.

use anyhow::{bail, Context as _};
use pinchkit_communication::{
    ConnectionManager, ControllerScript, LinkConfig, LinkSupervisor, PortScanner, ProtocolConfig,
    RoutineExecutor, RoutineHandle, SharedBackend, SharedConnection, VirtualSerialBackend,
};
use pinchkit_core::{
    AppEvent, ConnectionEvent, ErrorSeverity, EventBus, EventCategory, EventFilter,
    RoutineCommand, RoutineError, RoutineOutcome, Servo,
};
use pinchkit_settings::Config;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Device path of the simulated controller
pub const SIMULATED_PORT: &str = "/dev/ttyPINCH0";

const HELP: &str = "\
Commands:
  status                     link and routine status
  ports                      serial ports (* marks the controller)
  routines                   routine catalog
  run <id> [repetitions]     start a routine
  stop                       stop the running routine
  servo <joint> <angle>      move base, arm, elbow or gripper
  help                       this text
  quit                       release the arm and exit
";

/// Link settings from the configuration file
pub fn link_config(config: &Config) -> LinkConfig {
    LinkConfig {
        baud_rate: config.connection.baud_rate,
        timeout: config.connection.timeout(),
        port_markers: config.connection.port_markers.clone(),
    }
}

/// Protocol settings from the configuration file
pub fn protocol_config(config: &Config) -> ProtocolConfig {
    ProtocolConfig {
        completed_sentinel: config.protocol.completed_sentinel.clone(),
        stopped_sentinel: config.protocol.stopped_sentinel.clone(),
        routine_timeout: config.protocol.routine_timeout(),
        stop_timeout: config.protocol.stop_timeout(),
        poll_interval: config.protocol.poll_interval(),
        settle_delay: config.connection.settle_delay(),
    }
}

/// A virtual backend with one scripted controller speaking the configured
/// sentinels
pub fn simulated_backend(config: &Config) -> VirtualSerialBackend {
    let backend = VirtualSerialBackend::new();
    let script = ControllerScript {
        completed: config.protocol.completed_sentinel.clone(),
        stopped: config.protocol.stopped_sentinel.clone(),
        ..Default::default()
    };
    backend.plug_controller(SIMULATED_PORT, "Arduino Uno (simulated)", script);
    backend
}

/// One operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Ports,
    Routines,
    Run { routine_id: u32, repetitions: u32 },
    Stop,
    Servo { servo: Servo, angle: u16 },
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse an input line; blank lines yield `None`
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("status", []) => Self::Status,
            ("ports", []) => Self::Ports,
            ("routines", []) => Self::Routines,
            ("run", [id]) => Self::Run {
                routine_id: parse_number(id, "routine id")?,
                repetitions: 1,
            },
            ("run", [id, reps]) => Self::Run {
                routine_id: parse_number(id, "routine id")?,
                repetitions: parse_number(reps, "repetitions")?,
            },
            ("stop", []) => Self::Stop,
            ("servo", [name, angle]) => Self::Servo {
                servo: Servo::from_name(name)
                    .with_context(|| format!("unknown joint '{}'", name))?,
                angle: parse_number(angle, "angle")?,
            },
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            (verb, _) => bail!("unrecognized command '{}' (try 'help')", verb),
        };
        Ok(Some(command))
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> anyhow::Result<T> {
    text.parse()
        .map_err(|_| anyhow::anyhow!("invalid {} '{}'", what, text))
}

/// What the input loop should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// A routine waiting out the settle delay before it is written
struct PendingStart {
    command: RoutineCommand,
    task: JoinHandle<Result<RoutineHandle, RoutineError>>,
}

/// Owns the link, the reconcile task and the executor
pub struct OperatorConsole {
    config: Config,
    connection: SharedConnection,
    executor: RoutineExecutor,
    supervisor: Option<LinkSupervisor>,
    events: Arc<EventBus>,
    starting: Option<PendingStart>,
    routine: Option<RoutineHandle>,
    stop: Option<RoutineHandle>,
}

impl OperatorConsole {
    /// Wire everything up and start reconciling; needs a tokio runtime
    pub fn start(config: Config, backend: SharedBackend) -> Self {
        let events = Arc::new(EventBus::new());
        let connection = ConnectionManager::new(backend, link_config(&config))
            .with_event_bus(Arc::clone(&events))
            .into_shared();
        let executor = RoutineExecutor::with_event_bus(
            Arc::clone(&connection),
            protocol_config(&config),
            Arc::clone(&events),
        );
        let supervisor = LinkSupervisor::start(
            Arc::clone(&connection),
            config.console.reconcile_interval(),
            Some(Arc::clone(&events)),
        );

        events.subscribe(
            EventFilter::Categories(vec![EventCategory::Error]),
            |event| {
                if let AppEvent::Error(ref fault) = event {
                    match fault.severity() {
                        ErrorSeverity::Warning => tracing::warn!("{}", event.description()),
                        ErrorSeverity::Error => tracing::error!("{}", event.description()),
                    }
                }
            },
        );

        Self {
            config,
            connection,
            executor,
            supervisor: Some(supervisor),
            events,
            starting: None,
            routine: None,
            stop: None,
        }
    }

    /// The shared connection
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// The routine executor
    pub fn executor(&self) -> &RoutineExecutor {
        &self.executor
    }

    /// Read commands until `quit`, end of input or Ctrl-C
    pub async fn run<R, W>(&mut self, input: R, mut out: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut events = self.events.receiver();

        out.write_all(b"PinchKit console ready; type 'help' for commands\n")
            .await?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::info!("End of input");
                        break;
                    };
                    if self.execute(&line, &mut out).await? == Flow::Quit {
                        break;
                    }
                }
                started = join_start(&mut self.starting) => {
                    self.starting = None;
                    match started {
                        Ok(handle) => self.routine = Some(handle),
                        Err(e) => out.write_all(format!("error: {}\n", e).as_bytes()).await?,
                    }
                }
                outcome = wait_for(&mut self.routine) => {
                    self.routine = None;
                    report_outcome("Routine", &outcome, &mut out).await?;
                }
                outcome = wait_for(&mut self.stop) => {
                    self.stop = None;
                    report_outcome("Stop", &outcome, &mut out).await?;
                }
                event = events.recv() => match event {
                    Ok(AppEvent::Connection(ConnectionEvent::StatusChanged { connected, port })) => {
                        let text = match (connected, port) {
                            (true, Some(port)) => format!("[link] connected on {}\n", port),
                            _ => "[link] disconnected\n".to_string(),
                        };
                        out.write_all(text.as_bytes()).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("Console missed {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    break;
                }
            }
            out.flush().await?;
        }
        Ok(())
    }

    /// Execute one input line
    ///
    /// Operator mistakes are reported on `out`; only output failures are
    /// returned as errors. `run` returns once the routine is scheduled; its
    /// outcome is reported by `run` as it arrives.
    pub async fn execute<W>(&mut self, line: &str, out: &mut W) -> anyhow::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        let command = match ConsoleCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                out.write_all(format!("error: {}\n", e).as_bytes()).await?;
                return Ok(Flow::Continue);
            }
        };

        let text = match command {
            ConsoleCommand::Status => self.status_text(),
            ConsoleCommand::Ports => self.ports_text(),
            ConsoleCommand::Routines => self.routines_text(),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => return Ok(Flow::Quit),
            ConsoleCommand::Run {
                routine_id,
                repetitions,
            } => match self.check_request(routine_id, repetitions) {
                Err(reason) => format!("error: {}\n", reason),
                Ok(name) => match self.schedule_routine(routine_id, repetitions) {
                    Ok(()) => format!("Running {} x{}\n", name, repetitions),
                    Err(e) => format!("error: {}\n", e),
                },
            },
            ConsoleCommand::Stop => self.stop_text().await,
            ConsoleCommand::Servo { servo, angle } => {
                match self.executor.move_servo(servo, angle) {
                    Ok(sent) if sent.angle != angle => {
                        format!("{} moved to {}° (clamped)\n", servo, sent.angle)
                    }
                    Ok(sent) => format!("{} moved to {}°\n", servo, sent.angle),
                    Err(e) => format!("error: {}\n", e),
                }
            }
        };

        out.write_all(text.as_bytes()).await?;
        Ok(Flow::Continue)
    }

    fn schedule_routine(&mut self, routine_id: u32, repetitions: u32) -> Result<(), RoutineError> {
        let command = RoutineCommand::run(routine_id, repetitions)?;
        if let Some(pending) = &self.starting {
            return Err(RoutineError::Busy {
                routine_id: pending.command.routine_id,
            });
        }
        if let Some(current) = self.executor.current_routine() {
            return Err(RoutineError::Busy {
                routine_id: current.routine_id,
            });
        }

        let executor = self.executor.clone();
        let task =
            tokio::spawn(async move { executor.start_routine(routine_id, repetitions).await });
        self.starting = Some(PendingStart { command, task });
        Ok(())
    }

    async fn stop_text(&mut self) -> String {
        if let Some(handle) = self.executor.stop_routine() {
            self.stop = Some(handle);
            return "Stop requested\n".to_string();
        }
        let Some(pending) = self.starting.take() else {
            return "No routine is running\n".to_string();
        };

        // the start may have written its command before the abort landed
        pending.task.abort();
        match pending.task.await {
            Ok(Ok(handle)) => {
                self.routine = Some(handle);
                match self.executor.stop_routine() {
                    Some(stop) => {
                        self.stop = Some(stop);
                        "Stop requested\n".to_string()
                    }
                    None => "No routine is running\n".to_string(),
                }
            }
            Ok(Err(e)) => format!("error: {}\n", e),
            Err(_) => format!("{} cancelled before it was sent\n", pending.command),
        }
    }

    fn check_request(&self, routine_id: u32, repetitions: u32) -> Result<String, String> {
        let console = &self.config.console;
        let Some(routine) = console.routine(routine_id) else {
            return Err(format!("unknown routine {} (see 'routines')", routine_id));
        };
        if !console.repetitions_allowed(repetitions) {
            return Err(format!(
                "repetitions must be between 0 and {}",
                console.max_repetitions
            ));
        }
        Ok(routine.name.clone())
    }

    fn status_text(&self) -> String {
        let link = match &self.supervisor {
            Some(supervisor) => supervisor.snapshot().to_string(),
            None => "Disconnected".to_string(),
        };
        let routine = match (self.executor.current_routine(), &self.starting) {
            (Some(command), _) => format!("{} in progress", command),
            (None, Some(pending)) => {
                format!("{} waiting for the controller to settle", pending.command)
            }
            (None, None) => "idle".to_string(),
        };
        format!("Link: {}\nRoutine: {}\n", link, routine)
    }

    fn ports_text(&self) -> String {
        let connection = self.connection.lock();
        let scanner: &PortScanner = connection.scanner();
        let ports = connection.available_ports();
        if ports.is_empty() {
            return "No serial ports found\n".to_string();
        }
        ports
            .iter()
            .map(|port| {
                let mark = if scanner.is_candidate(port) { '*' } else { ' ' };
                format!("{} {}\n", mark, port)
            })
            .collect()
    }

    fn routines_text(&self) -> String {
        self.config
            .console
            .routines
            .iter()
            .map(|r| format!("{:>3}  {:<14} {}\n", r.id, r.name, r.description))
            .collect()
    }

    /// Stop polling, send a last stop if needed and release the port
    pub async fn shutdown(mut self) {
        if let Some(pending) = self.starting.take() {
            pending.task.abort();
        }
        self.executor.shutdown();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown().await;
        }
        self.connection.lock().disconnect();
        tracing::info!("Console shut down");
    }
}

impl Drop for OperatorConsole {
    fn drop(&mut self) {
        // covers exits that skip `shutdown`
        drop(self.supervisor.take());
        if let Some(pending) = self.starting.take() {
            pending.task.abort();
        }
        self.executor.shutdown();
        self.connection.lock().disconnect();
    }
}

async fn join_start(pending: &mut Option<PendingStart>) -> anyhow::Result<RoutineHandle> {
    let Some(pending) = pending else {
        return std::future::pending().await;
    };
    match (&mut pending.task).await {
        Ok(started) => Ok(started?),
        Err(e) => bail!("{} was not sent: {}", pending.command, e),
    }
}

async fn wait_for(handle: &mut Option<RoutineHandle>) -> RoutineOutcome {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn report_outcome<W>(what: &str, outcome: &RoutineOutcome, out: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let text = if outcome.needs_attention() {
        format!("!! {}: {}\n", what, outcome)
    } else {
        format!("{}: {}\n", what, outcome)
    };
    out.write_all(text.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_config() -> Config {
        let mut config = Config::new();
        config.connection.settle_delay_ms = 0;
        config.console.reconcile_interval_ms = 20;
        config
    }

    async fn started_routine(console: &mut OperatorConsole) -> RoutineHandle {
        let pending = console.starting.take().expect("a routine was scheduled");
        pending.task.await.unwrap().unwrap()
    }

    fn console(config: Config) -> (VirtualSerialBackend, OperatorConsole) {
        let backend = VirtualSerialBackend::new();
        let script = ControllerScript::default().with_routine_duration(Duration::from_millis(50));
        backend.plug_controller(SIMULATED_PORT, "Arduino Uno (simulated)", script);
        let console = OperatorConsole::start(config, Arc::new(backend.clone()));
        assert!(console.connection().lock().reconcile());
        (backend, console)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  ").unwrap(), None);
        assert_eq!(
            ConsoleCommand::parse("run 2").unwrap(),
            Some(ConsoleCommand::Run {
                routine_id: 2,
                repetitions: 1
            })
        );
        assert_eq!(
            ConsoleCommand::parse("RUN 3 5").unwrap(),
            Some(ConsoleCommand::Run {
                routine_id: 3,
                repetitions: 5
            })
        );
        assert_eq!(
            ConsoleCommand::parse("servo pinch 30").unwrap(),
            Some(ConsoleCommand::Servo {
                servo: Servo::Gripper,
                angle: 30
            })
        );
        assert_eq!(ConsoleCommand::parse("exit").unwrap(), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ConsoleCommand::parse("run x").is_err());
        assert!(ConsoleCommand::parse("run 1 -2").is_err());
        assert!(ConsoleCommand::parse("servo wrist 10").is_err());
        assert!(ConsoleCommand::parse("dance").is_err());
        assert!(ConsoleCommand::parse("stop now").is_err());
    }

    #[test]
    fn test_config_conversion() {
        let mut config = Config::new();
        config.protocol.stop_timeout_secs = 0;
        config.connection.port_markers = vec!["ch340".to_string()];

        let protocol = protocol_config(&config);
        assert_eq!(protocol.stop_timeout, None);
        assert_eq!(protocol.routine_timeout, Duration::from_secs(80));
        assert_eq!(protocol.settle_delay, Duration::from_millis(4000));

        let link = link_config(&config);
        assert_eq!(link.port_markers, vec!["ch340"]);
        assert_eq!(link.timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_and_wait_for_completion() {
        let (backend, mut console) = console(quick_config());
        let mut out = Vec::new();

        let flow = console.execute("run 1 2", &mut out).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        let handle = started_routine(&mut console).await;
        assert_eq!(handle.await, RoutineOutcome::Completed);
        assert_eq!(backend.written_lines(SIMULATED_PORT), vec!["1,2"]);
        assert!(String::from_utf8(out).unwrap().contains("Running Gripper test x2"));

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_mistakes_are_reported() {
        let (backend, mut console) = console(quick_config());
        let mut out = Vec::new();

        console.execute("run 9", &mut out).await.unwrap();
        console.execute("run 1 6", &mut out).await.unwrap();
        console.execute("stop", &mut out).await.unwrap();
        console.execute("bogus", &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("unknown routine 9"));
        assert!(text.contains("repetitions must be between 0 and 5"));
        assert!(text.contains("No routine is running"));
        assert!(text.contains("unrecognized command 'bogus'"));
        assert!(backend.written_lines(SIMULATED_PORT).is_empty());

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_servo_command_reports_clamping() {
        let (backend, mut console) = console(quick_config());
        let mut out = Vec::new();

        console.execute("servo elbow 200", &mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().contains("elbow moved to 150° (clamped)"));
        assert_eq!(backend.written_lines(SIMULATED_PORT), vec!["S2,150"]);

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_quit_releases_port() {
        let (backend, mut console) = console(quick_config());
        let input: &[u8] = b"help\nquit\nrun 1\n";
        let mut out = Vec::new();

        console.run(input, &mut out).await.unwrap();
        console.shutdown().await;

        assert!(!backend.is_open(SIMULATED_PORT));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Commands:"));
        assert!(backend.written_lines(SIMULATED_PORT).is_empty());
    }

    #[tokio::test]
    async fn test_drop_stops_running_routine() {
        let mut config = quick_config();
        config.protocol.routine_timeout_secs = 60;
        let backend = VirtualSerialBackend::new();
        backend.plug(SIMULATED_PORT, "Arduino Uno");

        {
            let mut console = OperatorConsole::start(config, Arc::new(backend.clone()));
            assert!(console.connection().lock().reconcile());
            let mut out = Vec::new();
            console.execute("run 4 1", &mut out).await.unwrap();
            let handle = started_routine(&mut console).await;
            console.routine = Some(handle);
        }

        assert_eq!(backend.written_lines(SIMULATED_PORT), vec!["4,1", "0,0"]);
        assert!(!backend.is_open(SIMULATED_PORT));
    }

    #[tokio::test]
    async fn test_settle_wait_keeps_console_responsive() {
        let mut config = quick_config();
        config.connection.settle_delay_ms = 4000;
        let (backend, mut console) = console(config);
        let mut out = Vec::new();

        tokio::time::timeout(Duration::from_millis(500), console.execute("run 1 1", &mut out))
            .await
            .expect("run returns while the controller settles")
            .unwrap();
        console.execute("run 2 1", &mut out).await.unwrap();
        console.execute("status", &mut out).await.unwrap();
        console.execute("stop", &mut out).await.unwrap();

        assert!(!console.executor().is_busy());
        assert!(backend.written_lines(SIMULATED_PORT).is_empty());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Routine 1 is still running"));
        assert!(text.contains("routine 1 x1 waiting for the controller to settle"));
        assert!(text.contains("routine 1 x1 cancelled before it was sent"));

        console.shutdown().await;
    }

    #[tokio::test]
    async fn test_loop_reports_outcome_after_settling() {
        let mut config = quick_config();
        config.connection.settle_delay_ms = 200;
        let (backend, mut console) = console(config);
        let (mut operator, input) = tokio::io::duplex(64);
        let mut out = Vec::new();

        let typing = tokio::spawn(async move {
            operator.write_all(b"run 1 1\nstatus\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(800)).await;
            operator.write_all(b"quit\n").await.unwrap();
            operator
        });
        tokio::time::timeout(
            Duration::from_secs(5),
            console.run(tokio::io::BufReader::new(input), &mut out),
        )
        .await
        .expect("console loop finishes")
        .unwrap();
        drop(typing.await.unwrap());

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("waiting for the controller to settle"), "{}", text);
        assert!(text.contains("Routine: Completed"), "{}", text);
        assert_eq!(backend.written_lines(SIMULATED_PORT), vec!["1,1"]);

        console.shutdown().await;
    }
}
