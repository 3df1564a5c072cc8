//! Webphone orchestrator
//!
//! [`Webphone`] ties the components together. All component state lives in a
//! single [`Core`] behind one mutex, so every delivery (gateway notification,
//! retry tick, network change, user action) runs its state transition to
//! completion before the next one starts. The lock is never held across an
//! `.await`: async operations read what they need, release the lock, await
//! the gateway, then re-check that the session and call are still the ones
//! they started with.
//!
//! Gateway notifications go through an unbounded channel and are handled by
//! one dispatcher task, strictly in delivery order.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webphone_core::{GatewayConfig, SipIdentity, WebphoneBuilder, WebphoneConfig};
//! # use webphone_core::{GatewayClient, WebphoneResult};
//! # async fn example(gateway: Arc<dyn GatewayClient>) -> WebphoneResult<()> {
//! let config = WebphoneConfig::new(GatewayConfig::new("gateway.example.com", 8989));
//! let phone = WebphoneBuilder::new(config).gateway(gateway).build()?;
//! phone.start().await;
//!
//! phone.register(SipIdentity::new("1000", "secret", "pbx.example.com", 5060)).await?;
//! phone.start_call("1001").await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod calls;
pub mod config;
pub mod connection;
pub mod controls;
pub mod error_channel;
pub mod media;
pub mod recovery;
pub mod registration;


use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::call::{CallStateMachine, ExtensionState, InCallStatus};
use crate::error::{ErrorKind, ErrorRecord};
use crate::events::{EventEmitter, EventStream, StateChange, WebphoneEvent};
use crate::gateway::{GatewayClient, GatewayEnvelope, GatewayEvent, MediaSink};
use crate::registration::{RegistrationAttempt, RegistrationController, RegistrationState};

pub use builder::WebphoneBuilder;
pub use config::WebphoneConfig;
pub use connection::{ConnectionSupervisor, ConnectivityState};
pub use error_channel::ErrorChannel;

/// All mutable component state
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) connection: ConnectionSupervisor,
    pub(crate) registration: RegistrationController,
    pub(crate) calls: CallStateMachine,
    pub(crate) errors: ErrorChannel,
    notifications: Vec<WebphoneEvent>,
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    connectivity: ConnectivityState,
    registration: RegistrationState,
    extension: ExtensionState,
    online: bool,
    call: InCallStatus,
}

impl Core {
    fn new(config: &WebphoneConfig, online: bool) -> Self {
        Self {
            connection: ConnectionSupervisor::new(online, config.reconnect.clone()),
            registration: RegistrationController::new(config.register_timeout_secs),
            calls: CallStateMachine::new(),
            errors: ErrorChannel::new(),
            notifications: Vec::new(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            connectivity: self.connection.state(),
            registration: self.registration.state(),
            extension: self.calls.extension(),
            online: self.connection.is_online(),
            call: self.calls.status(),
        }
    }

    /// Record on the error channel and notify observers
    pub(crate) fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let record = self.errors.record(kind, message);
        self.notifications.push(WebphoneEvent::Error(record));
    }
}

impl Snapshot {
    fn changes(&self, after: &Snapshot) -> Vec<WebphoneEvent> {
        let mut events = Vec::new();
        if let Some(change) = StateChange::between(self.connectivity, after.connectivity) {
            events.push(WebphoneEvent::ConnectivityChanged(change));
        }
        if let Some(change) = StateChange::between(self.registration, after.registration) {
            events.push(WebphoneEvent::RegistrationChanged(change));
        }
        if let Some(change) = StateChange::between(self.extension, after.extension) {
            events.push(WebphoneEvent::ExtensionChanged(change));
        }
        if self.online != after.online {
            events.push(WebphoneEvent::NetworkChanged {
                online: after.online,
            });
        }
        if self.call != after.call {
            events.push(WebphoneEvent::CallUpdated(after.call.clone()));
        }
        events
    }
}

pub(crate) struct Inner {
    pub(crate) config: WebphoneConfig,
    pub(crate) gateway: Arc<dyn GatewayClient>,
    pub(crate) local_media: Option<Arc<dyn MediaSink>>,
    pub(crate) remote_media: Option<Arc<dyn MediaSink>>,
    /// Opaque id sent with every plugin attach
    pub(crate) opaque_id: String,
    pub(crate) core: Mutex<Core>,
    pub(crate) events: EventEmitter,
    pub(crate) gateway_tx: mpsc::UnboundedSender<GatewayEnvelope>,
    gateway_rx: Mutex<Option<mpsc::UnboundedReceiver<GatewayEnvelope>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
        let core = self.core.get_mut();
        core.registration.reset();
        core.connection.stop();
    }
}

/// Handle to a webphone instance. Cloning is cheap.
#[derive(Clone)]
pub struct Webphone {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Webphone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Webphone")
            .field("opaque_id", &self.inner.opaque_id)
            .field("core", &*self.inner.core.lock())
            .finish()
    }
}

impl Webphone {
    pub(crate) fn new(
        config: WebphoneConfig,
        gateway: Arc<dyn GatewayClient>,
        local_media: Option<Arc<dyn MediaSink>>,
        remote_media: Option<Arc<dyn MediaSink>>,
        online: bool,
        event_capacity: usize,
    ) -> Self {
        let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
        let core = Core::new(&config, online);
        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                local_media,
                remote_media,
                opaque_id: format!("webphone-{}", uuid::Uuid::new_v4()),
                core: Mutex::new(core),
                events: EventEmitter::new(event_capacity),
                gateway_tx,
                gateway_rx: Mutex::new(Some(gateway_rx)),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Run `f` on the core, then publish every resulting notification once
    /// the lock is released.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let (result, events) = {
            let mut core = self.inner.core.lock();
            let before = core.snapshot();
            let result = f(&mut core);
            let mut events = before.changes(&core.snapshot());
            events.append(&mut core.notifications);
            (result, events)
        };
        for event in events {
            self.inner.events.emit(event);
        }
        result
    }

    /// Start supervising the gateway connection.
    ///
    /// Spawns the notification dispatcher on first use and bootstraps
    /// immediately when the host is online.
    pub async fn start(&self) {
        if let Some(rx) = self.inner.gateway_rx.lock().take() {
            let weak = Arc::downgrade(&self.inner);
            let task = tokio::spawn(dispatch(weak, rx));
            *self.inner.dispatcher.lock() = Some(task);
        }
        self.with_core(|core| core.connection.start());
        info!(opaque_id = %self.inner.opaque_id, "Webphone started");
        self.drive_connectivity(true);
    }

    /// Tear everything down: destroy the session, cancel the retry timer
    /// and reset all states. Notifications of the old session are ignored
    /// from here on.
    pub async fn stop(&self) {
        let session = self.with_core(|core| {
            core.registration.reset();
            core.calls.go_offline();
            core.connection.stop()
        });
        if let Some(session) = session {
            if let Err(e) = session.destroy().await {
                debug!(error = %e, "Session teardown on stop failed");
            }
        }
        info!("Webphone stopped");
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.inner.core.lock().connection.state()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.inner.core.lock().registration.state()
    }

    pub fn extension_state(&self) -> ExtensionState {
        self.inner.core.lock().calls.extension()
    }

    pub fn in_call_status(&self) -> InCallStatus {
        self.inner.core.lock().calls.status()
    }

    /// Host network flag as last reported through [`Webphone::set_online`]
    pub fn is_online(&self) -> bool {
        self.inner.core.lock().connection.is_online()
    }

    /// Most recent error record, cleared on successful registration
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.inner.core.lock().errors.latest().cloned()
    }

    /// Seconds counted by the registration retry timer
    pub fn retry_counter(&self) -> u64 {
        self.inner.core.lock().registration.retry_counter()
    }

    pub fn registration_attempt(&self) -> Option<RegistrationAttempt> {
        self.inner.core.lock().registration.attempt().cloned()
    }

    pub fn config(&self) -> &WebphoneConfig {
        &self.inner.config
    }

    pub fn opaque_id(&self) -> &str {
        &self.inner.opaque_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WebphoneEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_stream(&self) -> EventStream {
        self.inner.events.stream()
    }

    async fn handle_gateway_event(&self, envelope: GatewayEnvelope) {
        let GatewayEnvelope { generation, event } = envelope;
        let current = self.inner.core.lock().connection.is_current(generation);
        if !current {
            debug!(generation, event = event.name(), "Ignoring notification from stale session");
            return;
        }

        match event {
            GatewayEvent::Message { message, jsep } => {
                self.handle_plugin_message(generation, message, jsep).await;
            }
            GatewayEvent::LocalStream(stream) => {
                if let Some(sink) = &self.inner.local_media {
                    debug!(stream = %stream.id, "Attaching local stream");
                    sink.attach(stream);
                }
            }
            GatewayEvent::RemoteStream(stream) => {
                if let Some(sink) = &self.inner.remote_media {
                    debug!(stream = %stream.id, "Attaching remote stream");
                    sink.attach(stream);
                }
            }
            GatewayEvent::Cleanup => {
                debug!(generation, "Got cleanup notification");
            }
            event @ (GatewayEvent::Detached
            | GatewayEvent::HandleError(_)
            | GatewayEvent::SessionError(_)
            | GatewayEvent::Destroyed) => {
                self.on_session_event(generation, event).await;
            }
        }
    }
}

async fn dispatch(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<GatewayEnvelope>) {
    while let Some(envelope) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        Webphone { inner }.handle_gateway_event(envelope).await;
    }
    debug!("Gateway notification dispatcher finished");
}
