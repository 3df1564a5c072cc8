//! Mock gateway shared by the integration tests
//!
//! The mock records every request sent through the SIP handle, counts
//! session opens and teardowns, and lets tests inject gateway notifications
//! through the sink of the most recent session.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use webphone_core::client::config::DebugLevel;
use webphone_core::gateway::{
    GatewayClient, GatewayError, GatewayEvent, GatewayEventSink, GatewayResult, GatewaySession,
    Jsep, MediaFlags, MediaSink, MediaStream, PluginHandle, SessionConfig,
};
use webphone_core::messages::{PluginMessage, SipRequest};
use webphone_core::{
    ConnectivityState, ExtensionState, GatewayConfig, ReconnectPolicy, RegistrationState,
    SipIdentity, Webphone, WebphoneBuilder, WebphoneConfig,
};

pub const AUDIO_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\nm=audio 40000 RTP/AVP 0 8\r\n";
pub const AUDIO_VIDEO_OFFER: &str =
    "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\nm=audio 40000 RTP/AVP 0\r\nm=video 40002 RTP/AVP 96\r\n";

/// Knobs and recordings shared by the mock session and handle
#[derive(Default)]
pub struct MockState {
    pub initializes: AtomicUsize,
    pub opens: AtomicUsize,
    pub attaches: AtomicUsize,
    pub destroys: AtomicUsize,
    pub local_hangups: AtomicUsize,

    pub webrtc_unsupported: AtomicBool,
    pub fail_open: AtomicBool,
    pub fail_attach: AtomicBool,
    pub fail_destroy: AtomicBool,
    pub fail_offer: AtomicBool,
    pub fail_answer: AtomicBool,
    pub fail_remote: AtomicBool,
    pub fail_send: AtomicBool,
    pub audio_muted: AtomicBool,

    pub sent: Mutex<Vec<PluginMessage>>,
    pub offers: Mutex<Vec<MediaFlags>>,
    pub answers: Mutex<Vec<(Jsep, MediaFlags)>>,
    pub remote: Mutex<Vec<Jsep>>,
    pub dtmf: Mutex<Vec<String>>,
    pub sinks: Mutex<Vec<GatewayEventSink>>,
    pub session_configs: Mutex<Vec<SessionConfig>>,
}

pub struct MockGateway {
    pub state: Arc<MockState>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState::default()),
        })
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.state.destroys.load(Ordering::SeqCst)
    }

    pub fn set(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    /// Sink of the most recent session
    pub fn latest_sink(&self) -> GatewayEventSink {
        self.state
            .sinks
            .lock()
            .last()
            .cloned()
            .expect("no session opened yet")
    }

    pub fn emit(&self, event: GatewayEvent) {
        assert!(self.latest_sink().emit(event), "webphone dropped the event channel");
    }

    /// Emit a SIP plugin event (`{"sip": "event", "result": {...}}`)
    pub fn emit_sip(&self, result: Value, jsep: Option<Jsep>) {
        self.emit(GatewayEvent::Message {
            message: json!({ "sip": "event", "result": result }),
            jsep,
        });
    }

    pub fn emit_event(&self, name: &str) {
        self.emit_sip(json!({ "event": name }), None);
    }

    pub fn sent(&self) -> Vec<PluginMessage> {
        self.state.sent.lock().clone()
    }

    /// Names of all requests sent so far
    pub fn sent_names(&self) -> Vec<&'static str> {
        self.state.sent.lock().iter().map(|m| m.message.name()).collect()
    }

    pub fn last_sent(&self) -> Option<PluginMessage> {
        self.state.sent.lock().last().cloned()
    }

    pub fn count_sent(&self, name: &str) -> usize {
        self.sent_names().into_iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn initialize(&self, _debug: &DebugLevel) -> GatewayResult<()> {
        self.state.initializes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_webrtc_supported(&self) -> bool {
        !self.state.webrtc_unsupported.load(Ordering::SeqCst)
    }

    async fn open_session(
        &self,
        config: SessionConfig,
        events: GatewayEventSink,
    ) -> GatewayResult<Arc<dyn GatewaySession>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.session_configs.lock().push(config);
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(GatewayError::new("Probably a network error, is the gateway down?"));
        }
        self.state.sinks.lock().push(events.clone());
        Ok(Arc::new(MockSession {
            state: self.state.clone(),
            events,
        }))
    }
}

pub struct MockSession {
    state: Arc<MockState>,
    events: GatewayEventSink,
}

#[async_trait]
impl GatewaySession for MockSession {
    async fn attach(
        &self,
        _plugin: &str,
        _opaque_id: &str,
        _events: GatewayEventSink,
    ) -> GatewayResult<Arc<dyn PluginHandle>> {
        self.state.attaches.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_attach.load(Ordering::SeqCst) {
            return Err(GatewayError::new("plugin not available"));
        }
        Ok(Arc::new(MockHandle {
            state: self.state.clone(),
        }))
    }

    async fn destroy(&self) -> GatewayResult<()> {
        self.state.destroys.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_destroy.load(Ordering::SeqCst) {
            return Err(GatewayError::new("session already gone"));
        }
        self.events.emit(GatewayEvent::Destroyed);
        Ok(())
    }
}

pub struct MockHandle {
    state: Arc<MockState>,
}

#[async_trait]
impl PluginHandle for MockHandle {
    async fn send(&self, message: PluginMessage) -> GatewayResult<()> {
        self.state.sent.lock().push(message);
        if self.state.fail_send.load(Ordering::SeqCst) {
            return Err(GatewayError::new("transport closed"));
        }
        Ok(())
    }

    async fn create_offer(&self, media: MediaFlags) -> GatewayResult<Jsep> {
        self.state.offers.lock().push(media);
        if self.state.fail_offer.load(Ordering::SeqCst) {
            return Err(GatewayError::new("NotAllowedError: permission denied"));
        }
        Ok(Jsep::offer("v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
    }

    async fn create_answer(&self, offer: &Jsep, media: MediaFlags) -> GatewayResult<Jsep> {
        self.state.answers.lock().push((offer.clone(), media));
        if self.state.fail_answer.load(Ordering::SeqCst) {
            return Err(GatewayError::new("NotFoundError: no microphone"));
        }
        Ok(Jsep::answer("v=0\r\no=- 3 3 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
    }

    async fn handle_remote_jsep(&self, jsep: &Jsep) -> GatewayResult<()> {
        self.state.remote.lock().push(jsep.clone());
        if self.state.fail_remote.load(Ordering::SeqCst) {
            return Err(GatewayError::new("InvalidAccessError: bad sdp"));
        }
        Ok(())
    }

    fn is_audio_muted(&self) -> bool {
        self.state.audio_muted.load(Ordering::SeqCst)
    }

    fn mute_audio(&self) {
        self.state.audio_muted.store(true, Ordering::SeqCst);
    }

    fn unmute_audio(&self) {
        self.state.audio_muted.store(false, Ordering::SeqCst);
    }

    async fn dtmf(&self, tones: &str) -> GatewayResult<()> {
        self.state.dtmf.lock().push(tones.to_string());
        Ok(())
    }

    async fn hangup(&self) {
        self.state.local_hangups.fetch_add(1, Ordering::SeqCst);
    }

    async fn detach(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Media sink that remembers attached streams
#[derive(Default)]
pub struct RecordingSink {
    pub streams: Mutex<Vec<MediaStream>>,
}

impl MediaSink for RecordingSink {
    fn attach(&self, stream: MediaStream) {
        self.streams.lock().push(stream);
    }
}

pub fn test_config() -> WebphoneConfig {
    let mut config = WebphoneConfig::new(GatewayConfig::new("gateway.example.com", 8989));
    config.register_timeout_secs = 30;
    config.reconnect = ReconnectPolicy::quick();
    config
}

pub fn test_identity() -> SipIdentity {
    SipIdentity::new("1000", "s3cret", "pbx.example.com", 5060).with_name("Front Desk")
}

/// Poll `condition` until it holds, failing after two seconds
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Let spawned tasks and the dispatcher drain
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub async fn connected_phone_with(config: WebphoneConfig) -> (Webphone, Arc<MockGateway>) {
    let gateway = MockGateway::new();
    let phone = WebphoneBuilder::new(config)
        .gateway(gateway.clone())
        .build()
        .expect("valid config");
    phone.start().await;
    eventually("connected", || phone.connectivity_state() == ConnectivityState::Connected).await;
    (phone, gateway)
}

pub async fn connected_phone() -> (Webphone, Arc<MockGateway>) {
    connected_phone_with(test_config()).await
}

pub async fn registered_phone() -> (Webphone, Arc<MockGateway>) {
    let (phone, gateway) = connected_phone().await;
    phone.register(test_identity()).await.expect("register sent");
    gateway.emit_event("registering");
    gateway.emit_event("registered");
    eventually("registered", || phone.extension_state() == ExtensionState::Idle).await;
    assert_eq!(phone.registration_state(), RegistrationState::Registered);
    (phone, gateway)
}

/// Registered phone with a ringing inbound call from 4000
pub async fn ringing_phone(offer: Option<&str>) -> (Webphone, Arc<MockGateway>) {
    let (phone, gateway) = registered_phone().await;
    gateway.emit_sip(
        json!({ "event": "incomingcall", "username": "sip:4000@pbx.example.com:5060" }),
        offer.map(|sdp| Jsep::offer(sdp)),
    );
    eventually("ringing", || phone.extension_state() == ExtensionState::ReceivingCall).await;
    (phone, gateway)
}

pub fn is_request(message: &PluginMessage, expected: &SipRequest) -> bool {
    &message.message == expected
}
