//! Extension and call state
//!
//! The webphone follows a single-call model: at most one [`CallSession`]
//! exists, and only while the extension is `Calling`, `ReceivingCall` or
//! `InCall`. [`CallStateMachine`] holds the synchronous part of the call
//! flow; the async user actions and signaling handlers that drive it live
//! in `client::calls`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::Jsep;
use crate::registration::ExtensionEffect;

/// Unique identifier for a call
pub type CallId = Uuid;

/// Presence of the local extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    /// Not registered
    Offline,
    /// Registered, no call
    Idle,
    /// Outbound call in setup
    Calling,
    /// Inbound call ringing
    ReceivingCall,
    InCall,
}

impl ExtensionState {
    /// Whether a call session belongs to this state
    pub fn has_call(&self) -> bool {
        matches!(
            self,
            ExtensionState::Calling | ExtensionState::ReceivingCall | ExtensionState::InCall
        )
    }
}

impl std::fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExtensionState::Offline => "offline",
            ExtensionState::Idle => "idle",
            ExtensionState::Calling => "calling",
            ExtensionState::ReceivingCall => "incomingcall",
            ExtensionState::InCall => "incall",
        };
        f.write_str(name)
    }
}

/// Direction of a call (from the extension's perspective)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// The single active call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub direction: CallDirection,
    /// Remote number (dialed number for outbound calls)
    pub number: String,
    pub muted: bool,
    pub on_hold: bool,
    pub on_speaker: bool,
    pub started_at: DateTime<Utc>,
    /// First transition to `InCall`
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(direction: CallDirection, number: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            number: number.into(),
            muted: false,
            on_hold: false,
            on_speaker: false,
            started_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Seconds since the call was answered, zero before that
    pub fn duration_secs(&self) -> u64 {
        self.connected_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Observable call status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InCallStatus {
    pub in_call: bool,
    /// Reason of the last remote hangup, empty if none
    pub hangup_reason: String,
    pub status: Option<CallSession>,
}

/// Which request ends the call locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalHangup {
    /// Reject a ringing inbound call
    Decline,
    Hangup,
}

/// Extract the number from an addressed identity such as
/// `sip:4000@pbx.example.com:5060`.
///
/// The number is whatever lies between the last `:` before the `@` and the
/// `@`. Returns an empty string when there is no `@`.
pub fn parse_remote_number(identity: &str) -> String {
    let Some(at) = identity.find('@') else {
        return String::new();
    };
    let user_part = &identity[..at];
    match user_part.rfind(':') {
        Some(colon) => user_part[colon + 1..].to_string(),
        None => user_part.to_string(),
    }
}

/// Extension state, the active call and transient negotiation state
#[derive(Debug)]
pub struct CallStateMachine {
    extension: ExtensionState,
    session: Option<CallSession>,
    hangup_reason: String,
    pending_offer: Option<Jsep>,
    dialed_number: Option<String>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            extension: ExtensionState::Offline,
            session: None,
            hangup_reason: String::new(),
            pending_offer: None,
            dialed_number: None,
        }
    }

    pub fn extension(&self) -> ExtensionState {
        self.extension
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut CallSession> {
        self.session.as_mut()
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn status(&self) -> InCallStatus {
        InCallStatus {
            in_call: self.session.is_some(),
            hangup_reason: self.hangup_reason.clone(),
            status: self.session.clone(),
        }
    }

    /// Set the extension state. `Offline` and `Idle` drop the call.
    pub fn set_extension(&mut self, next: ExtensionState) {
        if !next.has_call() {
            self.session = None;
            self.pending_offer = None;
        }
        if next == ExtensionState::Offline {
            self.dialed_number = None;
        }
        if next == ExtensionState::InCall {
            if let Some(session) = self.session.as_mut() {
                session.connected_at.get_or_insert_with(Utc::now);
            }
        }
        if self.extension != next {
            tracing::debug!(from = %self.extension, to = %next, "Extension state changed");
            self.extension = next;
        }
    }

    /// Apply the extension side effect of a registration transition
    pub fn apply_registration_effect(&mut self, effect: ExtensionEffect) {
        match effect {
            ExtensionEffect::Unchanged => {}
            ExtensionEffect::Idle => {
                if !self.extension.has_call() {
                    self.set_extension(ExtensionState::Idle);
                }
            }
            ExtensionEffect::Offline => self.go_offline(),
        }
    }

    /// Session or registration lost
    pub fn go_offline(&mut self) {
        self.hangup_reason.clear();
        self.set_extension(ExtensionState::Offline);
    }

    pub fn set_pending_offer(&mut self, jsep: Jsep) {
        self.pending_offer = Some(jsep);
    }

    pub fn pending_offer(&self) -> Option<&Jsep> {
        self.pending_offer.as_ref()
    }

    /// Consume the last remote description
    pub fn take_pending_offer(&mut self) -> Option<Jsep> {
        self.pending_offer.take()
    }

    /// Remember the number of an outbound dial until `calling` arrives
    pub fn begin_dial(&mut self, number: impl Into<String>) {
        self.dialed_number = Some(number.into());
    }

    pub fn clear_dial(&mut self) {
        self.dialed_number = None;
    }

    pub fn dialed_number(&self) -> Option<&str> {
        self.dialed_number.as_deref()
    }

    /// `calling` event. Ignored unless a dial is pending.
    pub fn on_calling(&mut self) -> Option<CallId> {
        if self.session.is_some() {
            return None;
        }
        let number = self.dialed_number.take()?;
        let session = CallSession::new(CallDirection::Outgoing, number);
        let id = session.id;
        self.session = Some(session);
        self.hangup_reason.clear();
        self.set_extension(ExtensionState::Calling);
        Some(id)
    }

    /// `incomingcall` event. Returns `None` when a call already exists.
    pub fn on_incoming_call(&mut self, identity: &str, offer: Option<Jsep>) -> Option<CallId> {
        if self.session.is_some() {
            return None;
        }
        let session = CallSession::new(CallDirection::Incoming, parse_remote_number(identity));
        let id = session.id;
        self.session = Some(session);
        self.pending_offer = offer;
        self.hangup_reason.clear();
        self.set_extension(ExtensionState::ReceivingCall);
        Some(id)
    }

    /// `accepted` / `updatingcall` event. Ignored without a call.
    pub fn on_accepted(&mut self) -> Option<CallId> {
        let id = self.call_id()?;
        self.set_extension(ExtensionState::InCall);
        Some(id)
    }

    /// `hangup` event from the remote side
    pub fn on_remote_hangup(&mut self, reason: Option<String>) {
        self.hangup_reason = reason.unwrap_or_default();
        self.dialed_number = None;
        if self.extension != ExtensionState::Offline {
            self.set_extension(ExtensionState::Idle);
        } else {
            self.session = None;
        }
    }

    /// End the call locally. `None` when there is nothing to end.
    pub fn local_hangup(&mut self) -> Option<LocalHangup> {
        self.dialed_number = None;
        let kind = match self.extension {
            ExtensionState::Offline | ExtensionState::Idle => return None,
            ExtensionState::ReceivingCall => LocalHangup::Decline,
            ExtensionState::Calling | ExtensionState::InCall => LocalHangup::Hangup,
        };
        self.set_extension(ExtensionState::Idle);
        Some(kind)
    }

    /// Whether `id` is still the active call
    pub fn is_current(&self, id: CallId) -> bool {
        self.call_id() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_number() {
        assert_eq!(parse_remote_number("sip:4000@pbx.example.com:5060"), "4000");
        assert_eq!(parse_remote_number("\"Bob\" <sip:4001@pbx.example.com>"), "4001");
        assert_eq!(parse_remote_number("4002@pbx"), "4002");
        assert_eq!(parse_remote_number("garbage"), "");
        assert_eq!(parse_remote_number(""), "");
    }

    #[test]
    fn test_calling_requires_pending_dial() {
        let mut calls = CallStateMachine::new();
        calls.set_extension(ExtensionState::Idle);

        assert!(calls.on_calling().is_none());
        assert_eq!(calls.extension(), ExtensionState::Idle);

        calls.begin_dial("1001");
        let id = calls.on_calling().expect("call created");
        let session = calls.session().unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.direction, CallDirection::Outgoing);
        assert_eq!(session.number, "1001");
        assert_eq!(calls.extension(), ExtensionState::Calling);
        assert!(calls.dialed_number().is_none());
    }

    #[test]
    fn test_incoming_call_is_single() {
        let mut calls = CallStateMachine::new();
        calls.set_extension(ExtensionState::Idle);

        let offer = Jsep::offer("v=0\r\nm=audio 4000 RTP/AVP 0\r\n");
        assert!(calls
            .on_incoming_call("sip:4000@pbx.example.com:5060", Some(offer.clone()))
            .is_some());
        assert_eq!(calls.extension(), ExtensionState::ReceivingCall);
        assert_eq!(calls.pending_offer(), Some(&offer));

        assert!(calls.on_incoming_call("sip:5000@pbx.example.com", None).is_none());
        assert_eq!(calls.session().unwrap().number, "4000");
        assert_eq!(calls.pending_offer(), Some(&offer));
    }

    #[test]
    fn test_offline_drops_call() {
        let mut calls = CallStateMachine::new();
        calls.set_extension(ExtensionState::Idle);
        calls.on_incoming_call("sip:4000@pbx", None);
        calls.on_accepted();
        assert!(calls.session().unwrap().connected_at.is_some());

        calls.go_offline();
        assert_eq!(calls.extension(), ExtensionState::Offline);
        assert!(calls.session().is_none());
        assert!(!calls.status().in_call);
    }

    #[test]
    fn test_registered_does_not_interrupt_call() {
        let mut calls = CallStateMachine::new();
        calls.set_extension(ExtensionState::Idle);
        calls.begin_dial("1001");
        calls.on_calling();

        calls.apply_registration_effect(ExtensionEffect::Idle);
        assert_eq!(calls.extension(), ExtensionState::Calling);
        assert!(calls.session().is_some());
    }

    #[test]
    fn test_local_hangup() {
        let mut calls = CallStateMachine::new();
        assert_eq!(calls.local_hangup(), None);

        calls.set_extension(ExtensionState::Idle);
        assert_eq!(calls.local_hangup(), None);

        calls.on_incoming_call("sip:4000@pbx", None);
        assert_eq!(calls.local_hangup(), Some(LocalHangup::Decline));
        assert_eq!(calls.extension(), ExtensionState::Idle);
        assert!(calls.session().is_none());

        calls.begin_dial("1001");
        calls.on_calling();
        calls.on_accepted();
        assert_eq!(calls.local_hangup(), Some(LocalHangup::Hangup));
    }

    #[test]
    fn test_remote_hangup_records_reason() {
        let mut calls = CallStateMachine::new();
        calls.set_extension(ExtensionState::Idle);
        calls.begin_dial("1001");
        calls.on_calling();

        calls.on_remote_hangup(Some("Busy Here".into()));
        let status = calls.status();
        assert!(!status.in_call);
        assert!(status.status.is_none());
        assert_eq!(status.hangup_reason, "Busy Here");
        assert_eq!(calls.extension(), ExtensionState::Idle);
    }

    #[test]
    fn test_hangup_forgets_unanswered_dial() {
        let mut calls = CallStateMachine::new();
        calls.set_extension(ExtensionState::Idle);

        // Rejected before the gateway ever reported `calling`
        calls.begin_dial("1001");
        calls.on_remote_hangup(Some("Forbidden".into()));
        assert!(calls.dialed_number().is_none());
        assert!(calls.on_calling().is_none());
        assert_eq!(calls.extension(), ExtensionState::Idle);

        calls.begin_dial("1002");
        assert_eq!(calls.local_hangup(), None);
        assert!(calls.dialed_number().is_none());
        assert!(calls.on_calling().is_none());
    }

    #[test]
    fn test_duration_before_answer_is_zero() {
        let session = CallSession::new(CallDirection::Incoming, "4000");
        assert_eq!(session.duration_secs(), 0);
    }
}
