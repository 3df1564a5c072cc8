//! SIP plugin message shapes
//!
//! Outbound requests are serialised as JSON objects tagged by a `request`
//! field (`{"request": "register", ...}`). Inbound plugin messages carry a
//! `result` object whose `event` field names what happened on the SIP side.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::gateway::Jsep;

/// Request sent to the SIP plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum SipRequest {
    Register {
        authuser: String,
        /// Public identity, `sip:user@domain:port`
        username: String,
        display_name: String,
        secret: String,
        force_tcp: bool,
        force_udp: bool,
        /// Outbound proxy, `sip:domain:port`
        proxy: String,
    },
    Unregister,
    Call {
        uri: String,
    },
    Accept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
    },
    Decline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
    },
    Hangup,
    Hold,
    Unhold,
    Update,
}

impl SipRequest {
    /// Value of the `request` field
    pub fn name(&self) -> &'static str {
        match self {
            SipRequest::Register { .. } => "register",
            SipRequest::Unregister => "unregister",
            SipRequest::Call { .. } => "call",
            SipRequest::Accept { .. } => "accept",
            SipRequest::Decline { .. } => "decline",
            SipRequest::Hangup => "hangup",
            SipRequest::Hold => "hold",
            SipRequest::Unhold => "unhold",
            SipRequest::Update => "update",
        }
    }
}

/// A request plus the optional session description sent with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMessage {
    pub message: SipRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
}

impl PluginMessage {
    pub fn new(message: SipRequest) -> Self {
        Self { message, jsep: None }
    }

    pub fn with_jsep(message: SipRequest, jsep: Jsep) -> Self {
        Self {
            message,
            jsep: Some(jsep),
        }
    }
}

/// `result` object of an inbound plugin message
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventResult {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_code")]
    pub code: Option<u16>,
}

/// Inbound plugin message
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PluginResponse {
    #[serde(default)]
    pub result: Option<EventResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
}

impl PluginResponse {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Signaling event carried by this message, if any
    pub fn event(&self) -> Option<SipEvent> {
        let result = self.result.as_ref()?;
        let name = result.event.as_deref()?;
        Some(SipEvent::from_result(name, result))
    }
}

/// Registration-related signaling events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Registering,
    Registered,
    RegistrationFailed {
        code: Option<u16>,
        reason: Option<String>,
    },
    Unregistering,
    Unregistered,
    /// A registration-family event this client does not know
    Unrecognized(String),
}

/// Signaling event reported by the SIP plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipEvent {
    Registration(RegistrationEvent),
    Calling,
    IncomingCall { username: Option<String> },
    Progress,
    Accepted,
    UpdatingCall,
    Hangup {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// Any other plugin event; ignored by the state machines
    Other(String),
}

impl SipEvent {
    fn from_result(name: &str, result: &EventResult) -> Self {
        match name {
            "registering" => SipEvent::Registration(RegistrationEvent::Registering),
            "registered" => SipEvent::Registration(RegistrationEvent::Registered),
            "registration_failed" => SipEvent::Registration(RegistrationEvent::RegistrationFailed {
                code: result.code,
                reason: result.reason.clone(),
            }),
            "unregistering" => SipEvent::Registration(RegistrationEvent::Unregistering),
            "unregistered" => SipEvent::Registration(RegistrationEvent::Unregistered),
            "calling" => SipEvent::Calling,
            "incomingcall" => SipEvent::IncomingCall {
                username: result.username.clone(),
            },
            "progress" => SipEvent::Progress,
            "accepted" => SipEvent::Accepted,
            "updatingcall" => SipEvent::UpdatingCall,
            "hangup" => SipEvent::Hangup {
                code: result.code,
                reason: result.reason.clone(),
            },
            other if other.contains("regist") => {
                SipEvent::Registration(RegistrationEvent::Unrecognized(other.to_string()))
            }
            other => SipEvent::Other(other.to_string()),
        }
    }
}

// The gateway sends SIP codes as numbers, older builds as strings.
fn lenient_code<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
