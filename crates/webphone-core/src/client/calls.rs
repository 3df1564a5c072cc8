//! Call signaling and user call actions
//!
//! Inbound plugin messages are parsed into [`SipEvent`]s and applied to the
//! call state machine. User actions (`answer`, `hangup`, `start_call`)
//! negotiate media through the [`MediaNegotiator`] and check, after every
//! await, that the session and the call they started with are still the
//! active ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::media::MediaNegotiator;
use super::Webphone;
use crate::call::{CallId, LocalHangup};
use crate::error::{ErrorKind, WebphoneError, WebphoneResult};
use crate::gateway::{Jsep, PluginHandle};
use crate::messages::{PluginMessage, PluginResponse, SipEvent, SipRequest};

/// SIP code used when an answer cannot be negotiated
pub const TEMPORARILY_UNAVAILABLE: u16 = 480;

/// SIP code used to reject a second inbound call
pub const BUSY_HERE: u16 = 486;

impl Webphone {
    pub(crate) async fn handle_plugin_message(
        &self,
        generation: u64,
        message: serde_json::Value,
        jsep: Option<Jsep>,
    ) {
        let response = match PluginResponse::from_value(message) {
            Ok(response) => response,
            Err(e) => {
                warn!(generation, error = %e, "Unparseable plugin message");
                return;
            }
        };

        if let Some(error) = &response.error {
            let message = match response.error_code {
                Some(code) => format!("{} ({})", error, code),
                None => error.clone(),
            };
            self.with_core(|core| core.record_error(ErrorKind::Plugin, message));
        }

        let Some(event) = response.event() else {
            return;
        };
        debug!(generation, ?event, has_jsep = jsep.is_some(), "Signaling event");

        match event {
            SipEvent::Registration(event) => {
                self.with_core(|core| core.apply_registration_event(&event));
            }
            SipEvent::IncomingCall { username } => {
                self.on_incoming_call(generation, username.unwrap_or_default(), jsep)
                    .await;
            }
            SipEvent::Calling => {
                self.with_core(|core| {
                    remember_offer(core, jsep);
                    match core.calls.on_calling() {
                        Some(call_id) => info!(%call_id, "Outbound call ringing"),
                        None => debug!("Calling event without a pending dial"),
                    }
                });
            }
            SipEvent::Progress => {
                let call_id = self.with_core(|core| {
                    remember_offer(core, jsep.clone());
                    core.calls.call_id()
                });
                if let (Some(call_id), Some(jsep)) = (call_id, jsep) {
                    self.apply_remote_description(generation, call_id, jsep).await;
                }
            }
            SipEvent::Accepted => {
                let call_id = self.with_core(|core| {
                    remember_offer(core, jsep.clone());
                    core.calls.on_accepted()
                });
                match (call_id, jsep) {
                    (Some(call_id), Some(jsep)) => {
                        info!(%call_id, "Call accepted");
                        self.apply_remote_description(generation, call_id, jsep).await;
                    }
                    (Some(call_id), None) => info!(%call_id, "Call accepted"),
                    (None, _) => debug!("Accepted event without an active call"),
                }
            }
            SipEvent::UpdatingCall => {
                self.on_updating_call(generation, jsep).await;
            }
            SipEvent::Hangup { code, reason } => {
                self.with_core(|core| {
                    info!(?code, reason = reason.as_deref().unwrap_or(""), "Remote hangup");
                    core.calls.on_remote_hangup(reason);
                });
            }
            SipEvent::Other(name) => {
                debug!(event = %name, "Unhandled plugin event");
            }
        }
    }

    async fn on_incoming_call(&self, generation: u64, username: String, jsep: Option<Jsep>) {
        let busy_handle = self.with_core(|core| {
            match core.calls.on_incoming_call(&username, jsep) {
                Some(call_id) => {
                    info!(%call_id, from = %username, "Incoming call");
                    None
                }
                None => core.connection.handle(),
            }
        });

        if let Some(handle) = busy_handle {
            info!(from = %username, "Declining incoming call, already in a call");
            let decline = SipRequest::Decline {
                code: Some(BUSY_HERE),
            };
            if let Err(e) = handle.send(PluginMessage::new(decline)).await {
                debug!(generation, error = %e, "Busy decline failed");
            }
        }
    }

    /// Forward a remote description from `progress`/`accepted`. When the
    /// handle rejects it the call is hung up.
    async fn apply_remote_description(&self, generation: u64, call_id: CallId, jsep: Jsep) {
        let Some(handle) = self.current_handle(generation) else {
            return;
        };
        let Err(err) = MediaNegotiator::apply_remote(handle.as_ref(), &jsep).await else {
            return;
        };

        let still_current = self.with_core(|core| {
            if !core.connection.is_current(generation) || !core.calls.is_current(call_id) {
                return false;
            }
            core.record_error(ErrorKind::RemoteDescription, err.to_string());
            core.calls.local_hangup();
            true
        });
        if still_current {
            warn!(%call_id, error = %err, "Remote description rejected, hanging up");
            send_quietly(handle.as_ref(), SipRequest::Hangup).await;
            handle.hangup().await;
        }
    }

    async fn on_updating_call(&self, generation: u64, jsep: Option<Jsep>) {
        let call_id = self.with_core(|core| {
            remember_offer(core, jsep.clone());
            core.calls.on_accepted()
        });
        let Some(call_id) = call_id else {
            debug!("Updating call event without an active call");
            return;
        };
        let Some(offer) = jsep else {
            debug!(%call_id, "Updating call event without an offer");
            return;
        };
        let Some(handle) = self.current_handle(generation) else {
            return;
        };

        let media = MediaNegotiator::update_presence(&offer.sdp).flags();
        match MediaNegotiator::create_answer(handle.as_ref(), &offer, media).await {
            Ok(answer) => {
                if !self.is_current_call(generation, call_id) {
                    return;
                }
                let message = PluginMessage::with_jsep(SipRequest::Update, answer);
                if let Err(e) = handle.send(message).await {
                    warn!(%call_id, error = %e, "Update acknowledgement failed");
                }
            }
            Err(e) => {
                self.with_core(|core| {
                    if core.calls.is_current(call_id) {
                        core.record_error(ErrorKind::UpdatingCall, e.to_string());
                    }
                });
            }
        }
    }

    /// Answer the ringing inbound call.
    ///
    /// Without a remote offer the call is treated as offerless and answered
    /// with a fresh audio-only offer. On negotiation failure the call is
    /// declined with 480.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use webphone_core::{ExtensionState, Webphone, WebphoneEvent};
    /// # async fn example(phone: Webphone) -> webphone_core::WebphoneResult<()> {
    /// let mut events = phone.subscribe();
    /// while let Ok(event) = events.recv().await {
    ///     if let WebphoneEvent::ExtensionChanged(change) = event {
    ///         if change.current == ExtensionState::ReceivingCall {
    ///             let caller = phone.in_call_status().status.map(|s| s.number);
    ///             println!("Answering {:?}", caller);
    ///             phone.answer().await?;
    ///             break;
    ///         }
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn answer(&self) -> WebphoneResult<()> {
        let (generation, handle, call_id, plan, extension) = self.with_core(|core| {
            let handle = core.connection.handle().ok_or(WebphoneError::NotConnected)?;
            let call_id = core.calls.call_id().ok_or(WebphoneError::NoActiveCall)?;
            let plan = MediaNegotiator::plan_answer(core.calls.take_pending_offer());
            let extension = core
                .registration
                .attempt()
                .map(|attempt| attempt.identity.authuser.clone());
            Ok::<_, WebphoneError>((
                core.connection.generation(),
                handle,
                call_id,
                plan,
                extension,
            ))
        })?;
        info!(%call_id, "Answering call");

        match MediaNegotiator::execute(handle.as_ref(), &plan).await {
            Ok(local) => {
                if !self.is_current_call(generation, call_id) {
                    return Err(WebphoneError::superseded("answer"));
                }
                let headers = extension.map(|ext| {
                    let contact = format!("<sip:{}@{}>", ext, self.inner.config.gateway.server);
                    BTreeMap::from([("Contact".to_string(), contact)])
                });
                let message = PluginMessage::with_jsep(SipRequest::Accept { headers }, local);
                handle.send(message).await?;
                Ok(())
            }
            Err(err) => {
                let current = self.with_core(|core| {
                    if !core.connection.is_current(generation) || !core.calls.is_current(call_id) {
                        return false;
                    }
                    core.record_error(ErrorKind::Answer, err.to_string());
                    core.calls.local_hangup();
                    true
                });
                if current {
                    let decline = SipRequest::Decline {
                        code: Some(TEMPORARILY_UNAVAILABLE),
                    };
                    send_quietly(handle.as_ref(), decline).await;
                }
                Err(err)
            }
        }
    }

    /// End the current call. A ringing inbound call is declined.
    ///
    /// The extension is idle afterwards whether or not the request could be
    /// sent.
    pub async fn hangup(&self) -> WebphoneResult<()> {
        let ended = self.with_core(|core| {
            let kind = core.calls.local_hangup()?;
            Some((kind, core.connection.handle()))
        });
        let Some((kind, handle)) = ended else {
            debug!("Hangup ignored, no call");
            return Ok(());
        };
        info!(?kind, "Hanging up");

        if let Some(handle) = handle {
            let request = match kind {
                LocalHangup::Decline => SipRequest::Decline { code: None },
                LocalHangup::Hangup => SipRequest::Hangup,
            };
            send_quietly(handle.as_ref(), request).await;
            handle.hangup().await;
        }
        Ok(())
    }

    /// Dial `number` in the registered domain. Video is always off.
    ///
    /// The number is trimmed and dialed as `sip:<number>@<domain>:<port>`
    /// using the identity of the last `register` call. The call only exists
    /// once the gateway reports `calling`; until then a failure is recorded
    /// as a `StartCall` error and nothing is left behind.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use webphone_core::{ExtensionState, Webphone, WebphoneError};
    /// # async fn example(phone: Webphone) -> webphone_core::WebphoneResult<()> {
    /// match phone.start_call("1001").await {
    ///     Ok(()) => println!("Dialing 1001"),
    ///     Err(WebphoneError::NotRegistered) => println!("Register first"),
    ///     Err(e) => return Err(e),
    /// }
    ///
    /// if phone.extension_state() == ExtensionState::InCall {
    ///     phone.send_dtmf("1#").await?;
    /// }
    /// phone.hangup().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start_call(&self, number: &str) -> WebphoneResult<()> {
        let number = number.trim();
        if number.is_empty() {
            return Ok(());
        }

        let (generation, handle, uri) = self.with_core(|core| {
            let handle = core.connection.handle().ok_or(WebphoneError::NotConnected)?;
            let uri = core
                .registration
                .attempt()
                .map(|attempt| attempt.call_uri(number))
                .ok_or(WebphoneError::NotRegistered)?;
            if core.calls.session().is_some() {
                return Err(WebphoneError::CallInProgress);
            }
            core.calls.begin_dial(number);
            Ok((core.connection.generation(), handle, uri))
        })?;
        info!(%uri, "Starting call");

        let offer =
            match MediaNegotiator::create_offer(handle.as_ref(), MediaNegotiator::outbound_flags())
                .await
            {
                Ok(offer) => offer,
                Err(err) => {
                    self.with_core(|core| {
                        core.calls.clear_dial();
                        core.record_error(ErrorKind::StartCall, err.to_string());
                    });
                    return Err(err);
                }
            };

        if self.current_handle(generation).is_none() {
            return Err(WebphoneError::superseded("start_call"));
        }
        let message = PluginMessage::with_jsep(SipRequest::Call { uri }, offer);
        if let Err(e) = handle.send(message).await {
            self.with_core(|core| {
                core.calls.clear_dial();
                core.record_error(ErrorKind::StartCall, e.reason.clone());
            });
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn current_handle(&self, generation: u64) -> Option<Arc<dyn PluginHandle>> {
        let core = self.inner.core.lock();
        if core.connection.is_current(generation) {
            core.connection.handle()
        } else {
            None
        }
    }

    fn is_current_call(&self, generation: u64, call_id: CallId) -> bool {
        let core = self.inner.core.lock();
        core.connection.is_current(generation) && core.calls.is_current(call_id)
    }
}

fn remember_offer(core: &mut super::Core, jsep: Option<Jsep>) {
    if let Some(jsep) = jsep {
        core.calls.set_pending_offer(jsep);
    }
}

async fn send_quietly(handle: &dyn PluginHandle, request: SipRequest) {
    let name = request.name();
    if let Err(e) = handle.send(PluginMessage::new(request)).await {
        debug!(request = name, error = %e, "Request failed");
    }
}
