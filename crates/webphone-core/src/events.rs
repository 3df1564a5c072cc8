//! Notifications published to webphone observers
//!
//! Every state change of the connection supervisor, the registration
//! controller and the call state machine is published as a
//! [`WebphoneEvent`] once the change is complete. Observers subscribe either
//! with a raw [`broadcast::Receiver`] or as an [`EventStream`].
//!
//! ```rust,no_run
//! # async fn example(phone: webphone_core::Webphone) {
//! use futures::StreamExt;
//! use webphone_core::events::WebphoneEvent;
//!
//! let mut events = phone.event_stream();
//! while let Some(Ok(event)) = events.next().await {
//!     if let WebphoneEvent::ExtensionChanged(change) = event {
//!         println!("extension {} -> {}", change.previous, change.current);
//!     }
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::call::{ExtensionState, InCallStatus};
use crate::client::connection::ConnectivityState;
use crate::error::ErrorRecord;
use crate::registration::RegistrationState;

/// Previous and current value of an observable state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange<T> {
    pub previous: T,
    pub current: T,
}

impl<T: PartialEq> StateChange<T> {
    /// `None` when nothing changed
    pub fn between(previous: T, current: T) -> Option<Self> {
        (previous != current).then_some(Self { previous, current })
    }
}

/// Events emitted by the webphone
#[derive(Debug, Clone, PartialEq)]
pub enum WebphoneEvent {
    ConnectivityChanged(StateChange<ConnectivityState>),
    RegistrationChanged(StateChange<RegistrationState>),
    ExtensionChanged(StateChange<ExtensionState>),
    /// Host network availability as last reported
    NetworkChanged { online: bool },
    /// The active call or the last hangup reason changed
    CallUpdated(InCallStatus),
    /// A failure was recorded on the error channel
    Error(ErrorRecord),
}

impl WebphoneEvent {
    /// Event name for log fields
    pub fn name(&self) -> &'static str {
        match self {
            WebphoneEvent::ConnectivityChanged(_) => "connectivity_changed",
            WebphoneEvent::RegistrationChanged(_) => "registration_changed",
            WebphoneEvent::ExtensionChanged(_) => "extension_changed",
            WebphoneEvent::NetworkChanged { .. } => "network_changed",
            WebphoneEvent::CallUpdated(_) => "call_updated",
            WebphoneEvent::Error(_) => "error",
        }
    }
}

/// Stream of webphone events
pub type EventStream = BroadcastStream<WebphoneEvent>;

/// Broadcast fan-out of [`WebphoneEvent`]s
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<WebphoneEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: WebphoneEvent) {
        tracing::trace!(event = event.name(), "Publishing webphone event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WebphoneEvent> {
        self.sender.subscribe()
    }

    pub fn stream(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
