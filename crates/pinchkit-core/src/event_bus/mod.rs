//! # Event Bus Module
//!
//! Publish/subscribe plumbing between the link layer and whatever front end
//! is attached (the headless console, or a GUI).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pinchkit_core::event_bus::{AppEvent, EventBus, EventCategory, EventFilter};
//!
//! let bus = Arc::new(EventBus::new());
//! let subscription = bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Connection]),
//!     |event| println!("{}", event.description()),
//! );
//! bus.unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
