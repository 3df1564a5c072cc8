//! Capability surface of the WebRTC media gateway
//!
//! The webphone never talks to the gateway transport directly. It consumes a
//! narrow set of async capabilities (open a session, attach a SIP handle,
//! create offers/answers, send plugin messages) and receives asynchronous
//! lifecycle notifications through a [`GatewayEventSink`].
//!
//! # Generations
//!
//! Every bootstrap of the gateway session gets a new *generation* number.
//! The sink handed to `open_session`/`attach` is stamped with it, and the
//! orchestrator discards notifications coming from an older generation. A
//! gateway implementation therefore only needs to push events into the sink
//! it was given; it never has to know whether the session is still current.
//!
//! ```text
//! ┌──────────────┐ open_session ┌────────────────┐ attach ┌──────────────┐
//! │ GatewayClient│─────────────►│ GatewaySession │───────►│ PluginHandle │
//! └──────────────┘              └───────┬────────┘        └──────┬───────┘
//!                                       │ Destroyed/SessionError  │ Message/Detached/...
//!                                       ▼                         ▼
//!                                ┌───────────────────────────────────┐
//!                                │    GatewayEventSink (generation)  │
//!                                └───────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::config::{DebugLevel, IceServer};
use crate::messages::PluginMessage;

/// Plugin identifier of the gateway's SIP plugin
pub const SIP_PLUGIN: &str = "janus.plugin.sip";

/// Result type for gateway capability calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failure reported by the gateway implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct GatewayError {
    /// Human readable failure description as reported by the gateway
    pub reason: String,
}

impl GatewayError {
    /// Create a gateway error from any displayable reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Session description exchanged with the gateway (JSEP envelope)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw SDP text
    pub sdp: String,
}

impl Jsep {
    /// Build an SDP offer envelope
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    /// Build an SDP answer envelope
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Media directions requested from offer/answer creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub audio_send: bool,
    pub audio_recv: bool,
    pub video_send: bool,
    pub video_recv: bool,
}

impl MediaFlags {
    /// Symmetric send/receive flags for each media kind
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            audio_send: audio,
            audio_recv: audio,
            video_send: video,
            video_recv: video,
        }
    }

    /// Audio in both directions, video disabled
    pub fn audio_only() -> Self {
        Self::new(true, false)
    }

    pub fn has_audio(&self) -> bool {
        self.audio_send || self.audio_recv
    }

    pub fn has_video(&self) -> bool {
        self.video_send || self.video_recv
    }
}

/// Opaque reference to a media stream produced by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    /// Gateway-assigned stream identifier
    pub id: String,
}

/// Output for a local or remote media stream (e.g. an audio element)
pub trait MediaSink: Send + Sync {
    /// Attach the stream to this output
    fn attach(&self, stream: MediaStream);
}

/// Parameters for opening a gateway session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Full gateway URL (`protocol://server:port/endpoint`)
    pub server: String,
    pub ice_servers: Vec<IceServer>,
    pub with_credentials: bool,
    pub token: Option<String>,
    pub api_secret: Option<String>,
}

/// Asynchronous notification pushed by a gateway session or handle
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Plugin message, optionally carrying a session description
    Message {
        message: serde_json::Value,
        jsep: Option<Jsep>,
    },
    /// Local capture stream became available
    LocalStream(MediaStream),
    /// Remote stream became available
    RemoteStream(MediaStream),
    /// The handle's peer connection was cleaned up
    Cleanup,
    /// The SIP handle was detached from the session
    Detached,
    /// The SIP handle reported an error
    HandleError(String),
    /// The running session reported an error
    SessionError(String),
    /// The session was destroyed
    Destroyed,
}

impl GatewayEvent {
    /// Short name used in log fields
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::Message { .. } => "message",
            GatewayEvent::LocalStream(_) => "local_stream",
            GatewayEvent::RemoteStream(_) => "remote_stream",
            GatewayEvent::Cleanup => "cleanup",
            GatewayEvent::Detached => "detached",
            GatewayEvent::HandleError(_) => "handle_error",
            GatewayEvent::SessionError(_) => "session_error",
            GatewayEvent::Destroyed => "destroyed",
        }
    }
}

/// A gateway event tagged with the generation of the session that produced it
#[derive(Debug, Clone)]
pub struct GatewayEnvelope {
    pub generation: u64,
    pub event: GatewayEvent,
}

/// Delivery channel for gateway notifications
///
/// Cloning is cheap; every clone carries the same generation stamp.
#[derive(Debug, Clone)]
pub struct GatewayEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<GatewayEnvelope>,
}

impl GatewayEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<GatewayEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the bootstrap this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns `false` once the webphone has shut down.
    pub fn emit(&self, event: GatewayEvent) -> bool {
        self.tx
            .send(GatewayEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Entry point of the gateway library
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// One-time library initialisation with the configured debug level
    async fn initialize(&self, debug: &DebugLevel) -> GatewayResult<()>;

    /// Whether the host environment can run WebRTC at all
    fn is_webrtc_supported(&self) -> bool;

    /// Open a new gateway session
    async fn open_session(
        &self,
        config: SessionConfig,
        events: GatewayEventSink,
    ) -> GatewayResult<Arc<dyn GatewaySession>>;
}

/// An open gateway session
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Attach a plugin handle to this session
    async fn attach(
        &self,
        plugin: &str,
        opaque_id: &str,
        events: GatewayEventSink,
    ) -> GatewayResult<Arc<dyn PluginHandle>>;

    /// Destroy the session. Implementations emit [`GatewayEvent::Destroyed`]
    /// once the session is gone.
    async fn destroy(&self) -> GatewayResult<()>;
}

/// SIP plugin handle attached to a session
#[async_trait]
pub trait PluginHandle: Send + Sync {
    /// Send a plugin request, optionally with a session description
    async fn send(&self, message: PluginMessage) -> GatewayResult<()>;

    /// Create a local offer
    async fn create_offer(&self, media: MediaFlags) -> GatewayResult<Jsep>;

    /// Create a local answer for a remote offer
    async fn create_answer(&self, offer: &Jsep, media: MediaFlags) -> GatewayResult<Jsep>;

    /// Apply a remote session description
    async fn handle_remote_jsep(&self, jsep: &Jsep) -> GatewayResult<()>;

    fn is_audio_muted(&self) -> bool;

    fn mute_audio(&self);

    fn unmute_audio(&self);

    /// Send DTMF tones in-band
    async fn dtmf(&self, tones: &str) -> GatewayResult<()>;

    /// Tear down the local peer connection and media
    async fn hangup(&self);

    /// Detach from the session
    async fn detach(&self) -> GatewayResult<()>;
}
