//! SIP registration state
//!
//! This module holds the synchronous half of the registration controller:
//! the [`RegistrationState`] machine, the cached [`RegistrationAttempt`] and
//! the one-second [`RetryTimer`] bookkeeping. The async half (sending
//! `register`/`unregister`, driving the timer task, tearing the session down
//! on timeout) lives in `client::registration`.
//!
//! # Timeout policy
//!
//! After a `register` request goes out the retry timer ticks once per second
//! while the state is `Unregistered`, `Registering` or `RegistrationFailed`.
//! When the counter reaches the configured timeout the state is forced to
//! `RegistrationFailed` and the gateway session is torn down, which in turn
//! makes the connection supervisor bootstrap again once the host is online.
//!
//! # Examples
//!
//! ```rust
//! use webphone_core::registration::{RegistrationController, RegistrationState};
//! use webphone_core::messages::RegistrationEvent;
//!
//! let mut controller = RegistrationController::new(30);
//! assert_eq!(controller.state(), RegistrationState::Unregistered);
//!
//! controller.apply_event(&RegistrationEvent::Registering);
//! assert_eq!(controller.state(), RegistrationState::Registering);
//!
//! controller.apply_event(&RegistrationEvent::Registered);
//! assert!(controller.state().is_registered());
//! assert_eq!(controller.retry_counter(), 0);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::messages::{RegistrationEvent, SipRequest};

/// Registration state of the SIP identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    RegistrationFailed,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered)
    }

    /// States in which the retry timer keeps counting
    pub fn counts_retries(&self) -> bool {
        matches!(
            self,
            RegistrationState::Unregistered
                | RegistrationState::Registering
                | RegistrationState::RegistrationFailed
        )
    }

    /// States whose entry resets and cancels the retry timer
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationState::Registered
                | RegistrationState::Unregistered
                | RegistrationState::RegistrationFailed
        )
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Unregistering => "unregistering",
            RegistrationState::RegistrationFailed => "registration_failed",
        };
        f.write_str(name)
    }
}

/// SIP transport preference forwarded to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

/// Credentials and address of the SIP extension to register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipIdentity {
    /// Extension / auth user (e.g. "1000")
    pub authuser: String,
    pub secret: String,
    /// Registrar domain
    pub domain: String,
    /// Registrar port
    pub port: u16,
    /// Display name sent with the registration
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub transport: Transport,
}

impl SipIdentity {
    pub fn new(
        authuser: impl Into<String>,
        secret: impl Into<String>,
        domain: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            authuser: authuser.into(),
            secret: secret.into(),
            domain: domain.into(),
            port,
            name: String::new(),
            transport: Transport::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Public identity, `sip:authuser@domain:port`
    pub fn public_uri(&self) -> String {
        format!("sip:{}@{}:{}", self.authuser, self.domain, self.port)
    }

    /// Default outbound proxy, `sip:domain:port`
    pub fn proxy_uri(&self) -> String {
        format!("sip:{}:{}", self.domain, self.port)
    }

    /// Build the `register` request. `proxy` overrides the default proxy URI.
    pub fn register_request(&self, proxy: Option<&str>) -> SipRequest {
        SipRequest::Register {
            authuser: self.authuser.clone(),
            username: self.public_uri(),
            display_name: self.name.clone(),
            secret: self.secret.clone(),
            force_tcp: self.transport == Transport::Tcp,
            force_udp: self.transport == Transport::Udp,
            proxy: proxy.map(str::to_string).unwrap_or_else(|| self.proxy_uri()),
        }
    }
}

/// Identity cached from the most recent `register` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAttempt {
    pub identity: SipIdentity,
    pub sent_at: DateTime<Utc>,
}

impl RegistrationAttempt {
    pub fn new(identity: SipIdentity) -> Self {
        Self {
            identity,
            sent_at: Utc::now(),
        }
    }

    /// Destination URI for an outbound call in the authenticated domain
    pub fn call_uri(&self, number: &str) -> String {
        format!("sip:{}@{}:{}", number, self.identity.domain, self.identity.port)
    }
}

/// Seconds counter plus the handle of the task that advances it
#[derive(Debug, Default)]
pub struct RetryTimer {
    counter: u64,
    token: u64,
    task: Option<AbortHandle>,
}

impl RetryTimer {
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Reserve the token for a timer task about to be spawned
    pub fn next_token(&mut self) -> u64 {
        self.token += 1;
        self.token
    }

    /// Install the task for `token`, aborting any previous one
    pub fn arm(&mut self, token: u64, task: AbortHandle) {
        if let Some(previous) = self.task.take() {
            previous.abort();
        }
        self.token = token;
        self.task = Some(task);
    }

    pub fn reset_counter(&mut self) {
        self.counter = 0;
    }

    /// Abort the task and zero the counter
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.token += 1;
        self.counter = 0;
    }

    // The calling task is the timer itself and is about to exit on its own.
    fn release(&mut self) {
        self.task = None;
        self.token += 1;
    }
}

/// Result of one retry timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep ticking
    Continue,
    /// The timer is stale or the state no longer counts retries
    Stop,
    /// The registration timeout was reached on this tick
    TimedOut,
}

/// What a registration transition implies for the extension state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionEffect {
    Unchanged,
    /// IDLE, unless a call is in progress
    Idle,
    Offline,
}

/// Registration state plus retry bookkeeping
#[derive(Debug)]
pub struct RegistrationController {
    state: RegistrationState,
    attempt: Option<RegistrationAttempt>,
    timer: RetryTimer,
    timeout_secs: u64,
}

impl RegistrationController {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            attempt: None,
            timer: RetryTimer::default(),
            timeout_secs,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn attempt(&self) -> Option<&RegistrationAttempt> {
        self.attempt.as_ref()
    }

    pub fn retry_counter(&self) -> u64 {
        self.timer.counter()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn timer_mut(&mut self) -> &mut RetryTimer {
        &mut self.timer
    }

    /// Whether a new `register` request may go out.
    ///
    /// When refused the retry counter is zeroed, so the next call goes
    /// through unless the state has moved to `Registering` or `Registered`
    /// in the meantime.
    pub fn admit_register(&mut self) -> bool {
        let busy = matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::Registering
        );
        if busy || self.timer.counter() > 0 {
            self.timer.reset_counter();
            return false;
        }
        true
    }

    pub fn record_attempt(&mut self, identity: SipIdentity) {
        self.attempt = Some(RegistrationAttempt::new(identity));
    }

    /// Move to `next`. Terminal states always reset the retry timer.
    pub fn set_state(&mut self, next: RegistrationState) {
        if next.is_terminal() {
            self.timer.cancel();
        }
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "Registration state changed");
            self.state = next;
        }
    }

    /// Apply a registration signaling event
    pub fn apply_event(&mut self, event: &RegistrationEvent) -> ExtensionEffect {
        let (next, effect) = match event {
            RegistrationEvent::Registered => (RegistrationState::Registered, ExtensionEffect::Idle),
            RegistrationEvent::RegistrationFailed { .. } => {
                (RegistrationState::RegistrationFailed, ExtensionEffect::Offline)
            }
            RegistrationEvent::Unregistered => {
                (RegistrationState::Unregistered, ExtensionEffect::Offline)
            }
            RegistrationEvent::Registering => {
                (RegistrationState::Registering, ExtensionEffect::Unchanged)
            }
            RegistrationEvent::Unregistering => {
                (RegistrationState::Unregistering, ExtensionEffect::Unchanged)
            }
            RegistrationEvent::Unrecognized(name) => {
                tracing::warn!(event = %name, "Unrecognized registration event");
                (RegistrationState::Unregistered, ExtensionEffect::Offline)
            }
        };
        self.set_state(next);
        effect
    }

    /// Session or handle lost. A failed registration is kept so its cause
    /// stays visible.
    pub fn on_session_lost(&mut self) {
        if self.state == RegistrationState::RegistrationFailed {
            self.timer.cancel();
        } else {
            self.set_state(RegistrationState::Unregistered);
        }
    }

    /// Advance the retry timer by one second
    pub fn tick(&mut self, token: u64) -> TickOutcome {
        if token != self.timer.token || !self.timer.is_armed() {
            return TickOutcome::Stop;
        }
        if !self.state.counts_retries() {
            self.timer.release();
            return TickOutcome::Stop;
        }

        self.timer.counter += 1;
        if self.timer.counter < self.timeout_secs {
            return TickOutcome::Continue;
        }

        tracing::warn!(seconds = self.timeout_secs, "Register event timeout");
        self.timer.release();
        self.timer.reset_counter();
        self.state = RegistrationState::RegistrationFailed;
        TickOutcome::TimedOut
    }

    /// Back to the initial state, keeping the cached attempt
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.state = RegistrationState::Unregistered;
    }
}
