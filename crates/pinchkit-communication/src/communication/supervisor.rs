//! Link supervisor
//!
//! Background task that reconciles the connection on a fixed interval and
//! publishes the resulting status for the UI indicator.

use super::manager::SharedConnection;
use pinchkit_core::{AppEvent, ConnectionEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default reconcile cadence
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(1000);

/// Link status as shown to the operator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// Whether a transport handle is held
    pub connected: bool,
    /// Remembered controller path
    pub port: Option<String>,
}

impl std::fmt::Display for LinkSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.port, self.connected) {
            (Some(port), true) => write!(f, "Connected ({})", port),
            (Some(port), false) => write!(f, "Disconnected (controller on {})", port),
            (None, _) => write!(f, "Disconnected"),
        }
    }
}

/// Owns the periodic reconcile task
pub struct LinkSupervisor {
    connection: SharedConnection,
    status: watch::Receiver<LinkSnapshot>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LinkSupervisor {
    /// Spawn the reconcile task
    ///
    /// The first reconcile runs immediately, so a controller that is already
    /// plugged in is detected and opened without waiting a full interval.
    pub fn start(
        connection: SharedConnection,
        interval: Duration,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        let (status_tx, status) = watch::channel(LinkSnapshot::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            Arc::clone(&connection),
            interval,
            status_tx,
            shutdown_rx,
            events,
        ));

        Self {
            connection,
            status,
            shutdown,
            task: Some(task),
        }
    }

    /// Latest published status
    pub fn snapshot(&self) -> LinkSnapshot {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.status.clone()
    }

    /// Stop the task and release the transport
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Link supervisor task failed: {}", e);
                }
            }
        }
        self.connection.lock().disconnect();
        tracing::debug!("Link supervisor stopped");
    }
}

impl Drop for LinkSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    connection: SharedConnection,
    period: Duration,
    status: watch::Sender<LinkSnapshot>,
    mut shutdown: watch::Receiver<bool>,
    events: Option<Arc<EventBus>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        // scanning and opening ports can block on the OS
        let conn = Arc::clone(&connection);
        let snapshot = match tokio::task::spawn_blocking(move || {
            let mut manager = conn.lock();
            let connected = manager.reconcile();
            LinkSnapshot {
                connected,
                port: manager.port().map(str::to_string),
            }
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Reconcile task failed: {}", e);
                break;
            }
        };

        let changed = status.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
        if changed {
            tracing::info!("Link status: {}", snapshot);
            if let Some(bus) = &events {
                bus.emit(AppEvent::Connection(ConnectionEvent::StatusChanged {
                    connected: snapshot.connected,
                    port: snapshot.port.clone(),
                }));
            }
        }
    }
}
