//! Event Bus implementation.
//!
//! The bus is owned explicitly (usually as an `Arc<EventBus>`) and handed to
//! the components that publish or listen; there is no process-wide instance.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{AppEvent, EventCategory};

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only specific event types
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these categories.
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &AppEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

type EventHandler = Box<dyn Fn(AppEvent) + Send + Sync>;

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for broadcast.
    pub channel_capacity: usize,
    /// Whether to keep the most recent events.
    pub enable_history: bool,
    /// Maximum number of events to retain in history.
    pub max_history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            enable_history: false,
            max_history_size: 100,
        }
    }
}

/// Error types for event bus operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventBusError {
    /// No subscribers are listening
    #[error("No active subscribers")]
    NoSubscribers,
}

/// Publish/subscribe hub for link and routine events
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    handlers: Arc<RwLock<HashMap<SubscriptionId, (EventFilter, EventHandler)>>>,
    history: Arc<RwLock<VecDeque<AppEvent>>>,
    config: EventBusConfig,
}

impl EventBus {
    /// Create a new event bus with default configuration
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create a new event bus with custom configuration
    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            config,
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of async receivers that got the event, or
    /// `NoSubscribers` when nobody at all is listening.
    pub fn publish(&self, event: AppEvent) -> Result<usize, EventBusError> {
        if self.config.enable_history {
            self.add_to_history(&event);
        }

        let handlers = self.handlers.read();
        for (_, (filter, handler)) in handlers.iter() {
            if filter.matches(&event) {
                handler(event.clone());
            }
        }

        match self.sender.send(event) {
            Ok(count) => Ok(count),
            Err(_) if handlers.is_empty() => Err(EventBusError::NoSubscribers),
            Err(_) => Ok(0),
        }
    }

    /// Publish and forget; a bus with no listeners is not an error here
    pub fn emit(&self, event: AppEvent) {
        tracing::trace!("event: {}", event.description());
        let _ = self.publish(event);
    }

    /// Subscribe to events with a synchronous handler
    ///
    /// The handler runs on the publishing thread, which may be holding the
    /// connection lock; keep it short and never call back into the link.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(AppEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers.write().insert(id, (filter, Box::new(handler)));
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Get a receiver for async consumers
    pub fn receiver(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Unsubscribe from events
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.handlers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Get the number of handler subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Recent events, oldest first (empty unless history is enabled)
    pub fn history(&self) -> Vec<AppEvent> {
        self.history.read().iter().cloned().collect()
    }

    /// Clear event history
    pub fn clear_history(&self) {
        self.history.write().clear();
    }

    fn add_to_history(&self, event: &AppEvent) {
        let mut history = self.history.write();
        history.push_back(event.clone());
        while history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::events::{ConnectionEvent, RoutineEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected(port: &str) -> AppEvent {
        AppEvent::Connection(ConnectionEvent::Connected {
            port: port.to_string(),
        })
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();

        let id = bus.subscribe(EventFilter::All, |_| {});
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.publish(connected("COM3")),
            Err(EventBusError::NoSubscribers)
        ));
        // emit swallows it
        bus.emit(connected("COM3"));
    }

    #[test]
    fn test_event_filtering() {
        let bus = EventBus::new();
        let connection_count = Arc::new(AtomicUsize::new(0));
        let routine_count = Arc::new(AtomicUsize::new(0));

        let cc = connection_count.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Connection]),
            move |_| {
                cc.fetch_add(1, Ordering::SeqCst);
            },
        );

        let rc = routine_count.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Routine]),
            move |_| {
                rc.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.emit(connected("/dev/ttyACM0"));
        bus.emit(AppEvent::Routine(RoutineEvent::StopRequested));
        bus.emit(AppEvent::Routine(RoutineEvent::StopRequested));

        assert_eq!(connection_count.load(Ordering::SeqCst), 1);
        assert_eq!(routine_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_history_max_size() {
        let bus = EventBus::with_config(EventBusConfig {
            enable_history: true,
            max_history_size: 3,
            ..Default::default()
        });

        for i in 0..5 {
            bus.emit(connected(&format!("COM{}", i)));
        }

        let history = bus.history();
        assert_eq!(history.len(), 3);
        assert!(history[0].description().contains("COM2"));

        bus.clear_history();
        assert!(bus.history().is_empty());
    }

    #[tokio::test]
    async fn test_async_receiver() {
        let bus = EventBus::new();
        let mut receiver = bus.receiver();

        bus.emit(connected("COM7"));

        match receiver.try_recv() {
            Ok(AppEvent::Connection(ConnectionEvent::Connected { port })) => {
                assert_eq!(port, "COM7")
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }
}
