//! Error types for the webphone core
//!
//! Two layers are involved:
//!
//! - [`WebphoneError`] is what user-facing operations return. It follows the
//!   usual `thiserror` pattern with helper constructors and a `category()`
//!   for grouping in logs.
//! - [`ErrorRecord`] is the observational record kept by the error channel.
//!   Every failure the core recovers from on its own (negotiation failures,
//!   registration rejections, lost sessions) produces one, tagged with the
//!   [`ErrorKind`] of the operation that originated it.
//!
//! Recovered failures never escape as panics or unhandled errors: they turn
//! into state transitions plus a record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayError;

/// Result type alias for webphone operations
pub type WebphoneResult<T> = Result<T, WebphoneError>;

/// Errors returned by webphone operations
#[derive(Error, Debug, Clone)]
pub enum WebphoneError {
    /// Gateway unreachable or session could not be opened
    #[error("Connectivity error: {reason}")]
    Connectivity { reason: String },

    #[error("WebRTC is not supported by the host environment")]
    WebRtcUnsupported,

    /// Registration rejected by the registrar
    #[error("Registration failed: {reason}")]
    Registration { reason: String },

    #[error("Registration timed out after {seconds}s")]
    RegistrationTimeout { seconds: u64 },

    /// Offer or answer creation failed
    #[error("Media negotiation failed: {reason}")]
    Negotiation { reason: String },

    /// A remote session description could not be applied
    #[error("Failed to handle remote description: {reason}")]
    SignalingHandling { reason: String },

    #[error("No SIP handle is attached to the gateway")]
    NotConnected,

    #[error("No registration attempt has been made")]
    NotRegistered,

    #[error("No active call")]
    NoActiveCall,

    #[error("A call is already in progress")]
    CallInProgress,

    /// The session or call changed while an operation was in flight
    #[error("Operation superseded: {operation}")]
    Superseded { operation: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// A gateway request failed to go out
    #[error("Gateway request failed: {reason}")]
    Gateway { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl WebphoneError {
    pub fn connectivity(reason: impl Into<String>) -> Self {
        Self::Connectivity {
            reason: reason.into(),
        }
    }

    pub fn registration(reason: impl Into<String>) -> Self {
        Self::Registration {
            reason: reason.into(),
        }
    }

    pub fn negotiation(reason: impl Into<String>) -> Self {
        Self::Negotiation {
            reason: reason.into(),
        }
    }

    pub fn signaling_handling(reason: impl Into<String>) -> Self {
        Self::SignalingHandling {
            reason: reason.into(),
        }
    }

    pub fn superseded(operation: impl Into<String>) -> Self {
        Self::Superseded {
            operation: operation.into(),
        }
    }

    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            WebphoneError::Connectivity { .. }
            | WebphoneError::RegistrationTimeout { .. }
            | WebphoneError::NotConnected
            | WebphoneError::Superseded { .. }
            | WebphoneError::Gateway { .. } => true,

            WebphoneError::WebRtcUnsupported
            | WebphoneError::InvalidConfiguration { .. }
            | WebphoneError::Serialization { .. } => false,

            _ => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            WebphoneError::Connectivity { .. }
            | WebphoneError::WebRtcUnsupported
            | WebphoneError::NotConnected
            | WebphoneError::Gateway { .. } => "connectivity",

            WebphoneError::Registration { .. }
            | WebphoneError::RegistrationTimeout { .. }
            | WebphoneError::NotRegistered => "registration",

            WebphoneError::Negotiation { .. } | WebphoneError::SignalingHandling { .. } => "media",

            WebphoneError::NoActiveCall
            | WebphoneError::CallInProgress
            | WebphoneError::Superseded { .. } => "call",

            WebphoneError::InvalidConfiguration { .. } => "configuration",

            WebphoneError::Serialization { .. } => "system",
        }
    }
}

impl From<GatewayError> for WebphoneError {
    fn from(err: GatewayError) -> Self {
        WebphoneError::Gateway { reason: err.reason }
    }
}

impl From<serde_json::Error> for WebphoneError {
    fn from(err: serde_json::Error) -> Self {
        WebphoneError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for WebphoneError {
    fn from(err: toml::de::Error) -> Self {
        WebphoneError::InvalidConfiguration {
            field: "toml".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Operation that produced an [`ErrorRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Registration,
    Answer,
    StartCall,
    Connection,
    Attach,
    SessionRunning,
    /// Applying the remote description of a `progress`/`accepted` event
    RemoteDescription,
    UpdatingCall,
    /// Error reported inside a plugin message
    Plugin,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Registration => "registration",
            ErrorKind::Answer => "answer",
            ErrorKind::StartCall => "start-call",
            ErrorKind::Connection => "connection",
            ErrorKind::Attach => "attach",
            ErrorKind::SessionRunning => "session-running",
            ErrorKind::RemoteDescription => "remote-description",
            ErrorKind::UpdatingCall => "updating-call",
            ErrorKind::Plugin => "plugin",
        };
        f.write_str(name)
    }
}

/// Structured error kept by the error channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
