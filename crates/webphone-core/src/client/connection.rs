//! Gateway session supervision
//!
//! The supervisor owns the single gateway session and SIP handle. It is the
//! only place that creates or destroys them:
//!
//! - [`Webphone::bootstrap`] tears the previous session down, initialises
//!   the gateway library, opens a new session and attaches the SIP handle.
//! - Host network changes arrive through [`Webphone::set_online`]. Going
//!   online bootstraps when the supervisor is neither connected nor
//!   connecting; going offline changes nothing and lets the gateway notice
//!   the dead transport on its own.
//! - Losing the session or handle cascades to the other components: the
//!   extension goes offline, any call is dropped and the registration is
//!   reset (a failed registration is kept so its cause stays visible).
//!
//! After a failed bootstrap the supervisor waits according to the
//! configured [`ReconnectPolicy`] before trying again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::recovery::ReconnectPolicy;
use super::{Core, Webphone};
use crate::error::{ErrorKind, WebphoneError, WebphoneResult};
use crate::gateway::{GatewayEvent, GatewayEventSink, GatewaySession, PluginHandle, SIP_PLUGIN};

/// State of the gateway session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    NotConnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectivityState::NotConnected => "not_connected",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Session ownership and connectivity bookkeeping
pub struct ConnectionSupervisor {
    state: ConnectivityState,
    online: bool,
    running: bool,
    generation: u64,
    session: Option<Arc<dyn GatewaySession>>,
    handle: Option<Arc<dyn PluginHandle>>,
    reconnect: ReconnectPolicy,
    failures: u32,
    pending_reconnect: Option<AbortHandle>,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state)
            .field("online", &self.online)
            .field("running", &self.running)
            .field("generation", &self.generation)
            .field("has_session", &self.session.is_some())
            .field("has_handle", &self.handle.is_some())
            .field("failures", &self.failures)
            .finish()
    }
}

impl ConnectionSupervisor {
    pub fn new(online: bool, reconnect: ReconnectPolicy) -> Self {
        Self {
            state: ConnectivityState::NotConnected,
            online,
            running: false,
            generation: 0,
            session: None,
            handle: None,
            reconnect,
            failures: 0,
            pending_reconnect: None,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Consecutive failed bootstraps
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether notifications stamped with `generation` still apply
    pub fn is_current(&self, generation: u64) -> bool {
        self.running && generation == self.generation
    }

    pub fn handle(&self) -> Option<Arc<dyn PluginHandle>> {
        self.handle.clone()
    }

    pub fn session(&self) -> Option<Arc<dyn GatewaySession>> {
        self.session.clone()
    }

    /// Record the host network flag. Returns `true` on a transition.
    pub fn set_online(&mut self, online: bool) -> bool {
        let changed = self.online != online;
        self.online = online;
        changed
    }

    /// Running, online and neither connected nor connecting
    pub fn wants_bootstrap(&self) -> bool {
        self.running
            && self.online
            && !matches!(
                self.state,
                ConnectivityState::Connected | ConnectivityState::Connecting
            )
    }

    /// Start a new generation and hand back the session to tear down
    pub fn begin_bootstrap(&mut self) -> (u64, Option<Arc<dyn GatewaySession>>) {
        self.cancel_reconnect();
        self.state = ConnectivityState::Connecting;
        self.generation += 1;
        self.handle = None;
        (self.generation, self.session.take())
    }

    /// Keep the session opened by `generation`. `false` if superseded.
    pub fn store_session(&mut self, generation: u64, session: Arc<dyn GatewaySession>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.session = Some(session);
        true
    }

    /// Keep the handle attached by `generation` and report connected
    pub fn attached(&mut self, generation: u64, handle: Arc<dyn PluginHandle>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.handle = Some(handle);
        self.state = ConnectivityState::Connected;
        self.failures = 0;
        true
    }

    /// Drop the handle and move to `next`. Later notifications of the lost
    /// session are treated as stale.
    pub fn lose(&mut self, next: ConnectivityState, forget_session: bool) {
        self.handle = None;
        if forget_session {
            self.session = None;
        }
        if next == ConnectivityState::Error {
            self.failures += 1;
        }
        self.generation += 1;
        self.state = next;
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.pending_reconnect.take() {
            task.abort();
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop supervising and hand back the session to destroy
    pub fn stop(&mut self) -> Option<Arc<dyn GatewaySession>> {
        self.cancel_reconnect();
        self.running = false;
        self.generation += 1;
        self.handle = None;
        self.failures = 0;
        self.state = ConnectivityState::NotConnected;
        self.session.take()
    }
}

impl Core {
    /// Start a bootstrap generation. Whatever ran on the previous session
    /// is gone with it.
    pub(crate) fn begin_bootstrap(&mut self) -> (u64, Option<Arc<dyn GatewaySession>>) {
        self.calls.go_offline();
        self.registration.on_session_lost();
        self.connection.begin_bootstrap()
    }

    /// Session or handle lost: cascade to registration and call state
    pub(crate) fn session_lost(&mut self, next: ConnectivityState, forget_session: bool) {
        self.connection.lose(next, forget_session);
        self.calls.go_offline();
        self.registration.on_session_lost();
    }
}

impl Webphone {
    /// Report host network availability.
    ///
    /// Going online bootstraps when not connected; going offline only
    /// updates the flag.
    pub async fn set_online(&self, online: bool) {
        let changed = self.with_core(|core| core.connection.set_online(online));
        if !changed {
            return;
        }
        info!(online, "Host network status changed");
        if online {
            self.drive_connectivity(true);
        }
    }

    /// Tear down any existing session and connect again.
    ///
    /// Resolves once the SIP handle is attached or the attempt failed.
    pub async fn bootstrap(&self) -> WebphoneResult<()> {
        let (generation, previous) = self.with_core(|core| {
            if !core.connection.is_running() {
                return Err(WebphoneError::connectivity("webphone is not started"));
            }
            Ok(core.begin_bootstrap())
        })?;
        self.run_bootstrap(generation, previous).await
    }

    /// Bootstrap when running, online and not connected or connecting.
    ///
    /// From `Error` the attempt waits for the reconnect backoff unless
    /// `immediate` is set.
    pub(crate) fn drive_connectivity(&self, immediate: bool) {
        self.with_core(|core| {
            let connection = &mut core.connection;
            if !connection.wants_bootstrap() {
                return;
            }

            if connection.state() == ConnectivityState::Error && !immediate {
                if connection.pending_reconnect.is_some() {
                    return;
                }
                let Some(delay) = connection.reconnect.delay_for(connection.failures) else {
                    warn!(
                        failures = connection.failures,
                        "Reconnect attempts exhausted, waiting for network change"
                    );
                    return;
                };
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    failures = connection.failures,
                    "Scheduling reconnect"
                );
                let weak = Arc::downgrade(&self.inner);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        let phone = Webphone { inner };
                        phone.with_core(|core| core.connection.pending_reconnect = None);
                        phone.drive_connectivity(true);
                    }
                });
                connection.pending_reconnect = Some(task.abort_handle());
                return;
            }

            let (generation, previous) = core.begin_bootstrap();
            let phone = self.clone();
            tokio::spawn(async move {
                if let Err(e) = phone.run_bootstrap(generation, previous).await {
                    debug!(generation, error = %e, "Bootstrap attempt ended");
                }
            });
        });
    }

    async fn run_bootstrap(
        &self,
        generation: u64,
        previous: Option<Arc<dyn GatewaySession>>,
    ) -> WebphoneResult<()> {
        info!(generation, "Bootstrapping gateway session");

        if let Some(previous) = previous {
            if let Err(e) = previous.destroy().await {
                debug!(generation, error = %e, "Previous session teardown failed");
            }
        }

        let gateway = self.inner.gateway.clone();
        if let Err(e) = gateway.initialize(&self.inner.config.debug.for_gateway()).await {
            let err = WebphoneError::connectivity(e.reason);
            self.bootstrap_failed(generation, ErrorKind::Connection, &err);
            return Err(err);
        }

        if !gateway.is_webrtc_supported() {
            let err = WebphoneError::WebRtcUnsupported;
            self.bootstrap_failed(generation, ErrorKind::Connection, &err);
            return Err(err);
        }

        let session_config = match self.inner.config.session_config() {
            Ok(config) => config,
            Err(err) => {
                self.bootstrap_failed(generation, ErrorKind::Connection, &err);
                return Err(err);
            }
        };
        let sink = GatewayEventSink::new(generation, self.inner.gateway_tx.clone());
        let session = match gateway.open_session(session_config, sink.clone()).await {
            Ok(session) => session,
            Err(e) => {
                let err = WebphoneError::connectivity(e.reason);
                self.bootstrap_failed(generation, ErrorKind::Connection, &err);
                return Err(err);
            }
        };

        if !self.with_core(|core| core.connection.store_session(generation, session.clone())) {
            debug!(generation, "Session opened for a superseded bootstrap, destroying");
            let _ = session.destroy().await;
            return Err(WebphoneError::superseded("bootstrap"));
        }

        let handle = match session.attach(SIP_PLUGIN, &self.inner.opaque_id, sink).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = WebphoneError::connectivity(e.reason);
                self.bootstrap_failed(generation, ErrorKind::Attach, &err);
                return Err(err);
            }
        };

        let auto_register = self.with_core(|core| {
            if core.connection.attached(generation, handle.clone()) {
                Some(self.inner.config.auto_register.clone())
            } else {
                None
            }
        });
        let Some(auto_register) = auto_register else {
            debug!(generation, "Handle attached for a superseded bootstrap, detaching");
            let _ = handle.detach().await;
            return Err(WebphoneError::superseded("bootstrap"));
        };
        info!(generation, plugin = SIP_PLUGIN, "SIP handle attached");

        if let Some(identity) = auto_register {
            if let Err(e) = self.register(identity).await {
                warn!(error = %e, "Automatic registration failed");
            }
        }
        Ok(())
    }

    fn bootstrap_failed(&self, generation: u64, kind: ErrorKind, err: &WebphoneError) {
        let current = self.with_core(|core| {
            if !core.connection.is_current(generation) {
                return false;
            }
            core.record_error(kind, err.to_string());
            core.session_lost(ConnectivityState::Error, false);
            true
        });
        if current {
            error!(generation, error = %err, "Bootstrap failed");
            self.drive_connectivity(false);
        }
    }

    /// Lifecycle notifications that end the session or handle
    pub(crate) async fn on_session_event(&self, generation: u64, event: GatewayEvent) {
        let lost = self.with_core(|core| {
            if !core.connection.is_current(generation) {
                return None;
            }
            match &event {
                GatewayEvent::Destroyed => {
                    warn!(generation, "Gateway session destroyed");
                    core.session_lost(ConnectivityState::NotConnected, true);
                    None
                }
                GatewayEvent::Detached => {
                    warn!(generation, "SIP plugin detached");
                    core.session_lost(ConnectivityState::NotConnected, false);
                    None
                }
                GatewayEvent::HandleError(reason) => {
                    core.record_error(ErrorKind::Attach, reason.clone());
                    core.session_lost(ConnectivityState::Error, false);
                    None
                }
                GatewayEvent::SessionError(reason) => {
                    core.record_error(ErrorKind::SessionRunning, reason.clone());
                    let session = core.connection.session();
                    core.session_lost(ConnectivityState::Error, true);
                    session
                }
                _ => None,
            }
        });

        if let Some(session) = lost {
            if let Err(e) = session.destroy().await {
                debug!(generation, error = %e, "Destroying failed session");
            }
        }
        self.drive_connectivity(false);
    }

    /// Session lost outside of a gateway notification (e.g. a failed
    /// teardown after a registration timeout)
    pub(crate) fn session_gone(&self, generation: u64) {
        let current = self.with_core(|core| {
            if !core.connection.is_current(generation) {
                return false;
            }
            core.session_lost(ConnectivityState::NotConnected, true);
            true
        });
        if current {
            self.drive_connectivity(false);
        }
    }
}
