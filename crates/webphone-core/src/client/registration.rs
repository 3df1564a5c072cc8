//! Registration operations
//!
//! `register` and `unregister` only send requests; the registration state
//! moves when the matching signaling event comes back. While an attempt is
//! unanswered a one-second retry timer counts towards the configured
//! timeout, after which the session is torn down so the supervisor starts
//! over.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::connection::ConnectivityState;
use super::{Core, Webphone};
use crate::error::{ErrorKind, WebphoneError, WebphoneResult};
use crate::messages::{PluginMessage, RegistrationEvent, SipRequest};
use crate::registration::{ExtensionEffect, RegistrationState, SipIdentity, TickOutcome};

/// Interval of the registration retry timer
pub const RETRY_TICK: Duration = Duration::from_secs(1);

impl Core {
    /// Apply a registration event to the registration and extension state
    pub(crate) fn apply_registration_event(&mut self, event: &RegistrationEvent) {
        if let RegistrationEvent::RegistrationFailed { code, reason } = event {
            let message = match (code, reason) {
                (Some(code), Some(reason)) => format!("{} {}", code, reason),
                (None, Some(reason)) => reason.clone(),
                (Some(code), None) => format!("registration failed with code {}", code),
                (None, None) => "registration failed".to_string(),
            };
            self.record_error(ErrorKind::Registration, message);
        }

        let effect = self.registration.apply_event(event);
        if self.registration.state() == RegistrationState::Registered {
            self.errors.clear();
        }
        self.calls.apply_registration_effect(effect);
    }
}

impl Webphone {
    /// Register a SIP identity through the attached handle.
    ///
    /// Does nothing while registered, registering or while the retry timer
    /// of a previous attempt has counted at least one second; in that case
    /// the counter is zeroed instead, so calling again sends a fresh request
    /// and restarts the timer.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use webphone_core::{SipIdentity, Transport, Webphone, WebphoneEvent, RegistrationState};
    /// # async fn example(phone: Webphone) -> webphone_core::WebphoneResult<()> {
    /// let mut events = phone.subscribe();
    /// let identity = SipIdentity::new("1000", "secret", "pbx.example.com", 5060)
    ///     .with_name("Front Desk")
    ///     .with_transport(Transport::Tcp);
    /// phone.register(identity).await?;
    ///
    /// while let Ok(event) = events.recv().await {
    ///     if let WebphoneEvent::RegistrationChanged(change) = event {
    ///         if change.current == RegistrationState::Registered {
    ///             break;
    ///         }
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register(&self, identity: SipIdentity) -> WebphoneResult<()> {
        let prepared = self.with_core(|core| {
            if !core.registration.admit_register() {
                return Ok(None);
            }
            let Some(handle) = core.connection.handle() else {
                return Err(WebphoneError::NotConnected);
            };
            core.registration.record_attempt(identity.clone());
            self.arm_retry_timer(core);
            Ok(Some(handle))
        })?;

        let Some(handle) = prepared else {
            debug!(user = %identity.authuser, "Register ignored, attempt already active");
            return Ok(());
        };

        let request = identity.register_request(self.inner.config.proxy.as_deref());
        if let Err(e) = handle.send(PluginMessage::new(request)).await {
            self.with_core(|core| {
                core.registration.timer_mut().cancel();
                core.record_error(ErrorKind::Registration, e.reason.clone());
            });
            return Err(e.into());
        }

        info!(uri = %identity.public_uri(), "Register request sent");
        Ok(())
    }

    /// Send an `unregister` request. State changes with the resulting event.
    pub async fn unregister(&self) -> WebphoneResult<()> {
        let handle = self
            .with_core(|core| core.connection.handle())
            .ok_or(WebphoneError::NotConnected)?;
        handle.send(PluginMessage::new(SipRequest::Unregister)).await?;
        info!("Unregister request sent");
        Ok(())
    }

    fn arm_retry_timer(&self, core: &mut Core) {
        let timer = core.registration.timer_mut();
        let token = timer.next_token();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETRY_TICK).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let phone = Webphone { inner };
                match phone.with_core(|core| retry_tick(core, token)) {
                    (TickOutcome::Continue, _) => continue,
                    (TickOutcome::Stop, _) => break,
                    (TickOutcome::TimedOut, teardown) => {
                        phone.teardown_after_timeout(teardown).await;
                        break;
                    }
                }
            }
        });
        timer.arm(token, task.abort_handle());
    }

    async fn teardown_after_timeout(&self, teardown: Option<Teardown>) {
        let Some(Teardown { generation, session }) = teardown else {
            return;
        };
        if let Err(e) = session.destroy().await {
            warn!(generation, error = %e, "Session teardown after registration timeout failed");
            self.session_gone(generation);
        }
    }
}

struct Teardown {
    generation: u64,
    session: Arc<dyn crate::gateway::GatewaySession>,
}

fn retry_tick(core: &mut Core, token: u64) -> (TickOutcome, Option<Teardown>) {
    let outcome = core.registration.tick(token);
    if outcome != TickOutcome::TimedOut {
        return (outcome, None);
    }

    let seconds = core.registration.timeout_secs();
    core.record_error(
        ErrorKind::Registration,
        WebphoneError::RegistrationTimeout { seconds }.to_string(),
    );
    core.calls.apply_registration_effect(ExtensionEffect::Offline);

    let teardown = match core.connection.session() {
        Some(session) if core.connection.state() != ConnectivityState::NotConnected => {
            Some(Teardown {
                generation: core.connection.generation(),
                session,
            })
        }
        _ => None,
    };
    (TickOutcome::TimedOut, teardown)
}
