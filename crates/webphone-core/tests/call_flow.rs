//! Call flow tests
//!
//! Outbound and inbound calls against the mock gateway, including the
//! failure paths that end a call on their own.

mod common;

use std::collections::BTreeMap;

use common::*;
use serde_json::json;
use webphone_core::gateway::{GatewayEvent, Jsep, MediaFlags};
use webphone_core::messages::SipRequest;
use webphone_core::{CallDirection, ErrorKind, ExtensionState, Webphone, WebphoneError};

/// Answered inbound call from 4000
async fn in_call_phone() -> (Webphone, std::sync::Arc<MockGateway>) {
    let (phone, gateway) = ringing_phone(Some(AUDIO_OFFER)).await;
    phone.answer().await.unwrap();
    gateway.emit_event("accepted");
    eventually("in call", || phone.extension_state() == ExtensionState::InCall).await;
    (phone, gateway)
}

#[tokio::test]
async fn test_outbound_call_lifecycle() {
    let (phone, gateway) = registered_phone().await;

    phone.start_call(" 1001 ").await.unwrap();
    let sent = gateway.last_sent().unwrap();
    assert_eq!(
        sent.message,
        SipRequest::Call {
            uri: "sip:1001@pbx.example.com:5060".into()
        }
    );
    assert_eq!(sent.jsep.as_ref().map(|j| j.kind.as_str()), Some("offer"));
    assert_eq!(gateway.state.offers.lock().last(), Some(&MediaFlags::new(true, false)));
    // Nothing moves until the plugin reports the call
    assert_eq!(phone.extension_state(), ExtensionState::Idle);

    gateway.emit_event("calling");
    eventually("calling", || phone.extension_state() == ExtensionState::Calling).await;
    let status = phone.in_call_status();
    assert!(status.in_call);
    let session = status.status.unwrap();
    assert_eq!(session.number, "1001");
    assert_eq!(session.direction, CallDirection::Outgoing);
    assert!(session.connected_at.is_none());

    let answer = Jsep::answer(AUDIO_OFFER);
    gateway.emit_sip(json!({ "event": "accepted" }), Some(answer.clone()));
    eventually("in call", || phone.extension_state() == ExtensionState::InCall).await;
    eventually("remote applied", || gateway.state.remote.lock().len() == 1).await;
    assert_eq!(gateway.state.remote.lock()[0], answer);
    assert!(phone.in_call_status().status.unwrap().connected_at.is_some());

    phone.hangup().await.unwrap();
    assert_eq!(gateway.last_sent().unwrap().message, SipRequest::Hangup);
    assert_eq!(gateway.state.local_hangups.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
    assert!(!phone.in_call_status().in_call);

    println!("✅ Outbound call went CALLING -> INCALL -> IDLE");
}

#[tokio::test]
async fn test_progress_applies_early_media() {
    let (phone, gateway) = registered_phone().await;
    phone.start_call("1001").await.unwrap();
    gateway.emit_event("calling");
    eventually("calling", || phone.extension_state() == ExtensionState::Calling).await;

    gateway.emit_sip(json!({ "event": "progress" }), Some(Jsep::answer(AUDIO_OFFER)));
    eventually("early media", || gateway.state.remote.lock().len() == 1).await;
    assert_eq!(phone.extension_state(), ExtensionState::Calling);
}

#[tokio::test]
async fn test_start_call_preconditions() {
    let (phone, gateway) = connected_phone().await;
    let err = phone.start_call("1001").await.unwrap_err();
    assert!(matches!(err, WebphoneError::NotRegistered));

    let (phone, gateway_in_call) = in_call_phone().await;
    let err = phone.start_call("1001").await.unwrap_err();
    assert!(matches!(err, WebphoneError::CallInProgress));
    assert_eq!(gateway_in_call.count_sent("call"), 0);

    // Blank numbers are ignored
    let (phone, registered) = registered_phone().await;
    phone.start_call("   ").await.unwrap();
    assert_eq!(registered.count_sent("call"), 0);
    assert_eq!(gateway.count_sent("call"), 0);
}

#[tokio::test]
async fn test_start_call_offer_failure() {
    let (phone, gateway) = registered_phone().await;
    gateway.set(&gateway.state.fail_offer, true);

    let err = phone.start_call("1001").await.unwrap_err();
    assert!(matches!(err, WebphoneError::Negotiation { .. }));
    assert_eq!(gateway.count_sent("call"), 0);
    assert_eq!(phone.last_error().unwrap().kind, ErrorKind::StartCall);

    // The dial was dropped, so a stray calling event creates no call
    gateway.emit_event("calling");
    settle().await;
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
}

#[tokio::test]
async fn test_incoming_call_and_answer() {
    let (phone, gateway) = ringing_phone(Some(AUDIO_OFFER)).await;

    let session = phone.in_call_status().status.unwrap();
    assert_eq!(session.number, "4000");
    assert_eq!(session.direction, CallDirection::Incoming);

    phone.answer().await.unwrap();
    let (offer, media) = gateway.state.answers.lock().last().cloned().unwrap();
    assert_eq!(offer.sdp, AUDIO_OFFER);
    assert_eq!(media, MediaFlags::new(true, false));

    let sent = gateway.last_sent().unwrap();
    let headers = BTreeMap::from([(
        "Contact".to_string(),
        "<sip:1000@gateway.example.com>".to_string(),
    )]);
    assert_eq!(
        sent.message,
        SipRequest::Accept {
            headers: Some(headers)
        }
    );
    assert_eq!(sent.jsep.map(|j| j.kind), Some("answer".to_string()));
    assert_eq!(phone.extension_state(), ExtensionState::ReceivingCall);

    gateway.emit_event("accepted");
    eventually("in call", || phone.extension_state() == ExtensionState::InCall).await;
}

#[tokio::test]
async fn test_answer_with_video_offer() {
    let (phone, gateway) = ringing_phone(Some(AUDIO_VIDEO_OFFER)).await;
    phone.answer().await.unwrap();

    let (_, media) = gateway.state.answers.lock().last().cloned().unwrap();
    assert_eq!(media, MediaFlags::new(true, true));
}

#[tokio::test]
async fn test_offerless_answer_sends_offer() {
    let (phone, gateway) = ringing_phone(None).await;
    phone.answer().await.unwrap();

    assert!(gateway.state.answers.lock().is_empty());
    assert_eq!(gateway.state.offers.lock().last(), Some(&MediaFlags::new(true, false)));
    let sent = gateway.last_sent().unwrap();
    assert_eq!(sent.message.name(), "accept");
    assert_eq!(sent.jsep.map(|j| j.kind), Some("offer".to_string()));
}

#[tokio::test]
async fn test_answer_failure_declines_with_480() {
    let (phone, gateway) = ringing_phone(Some(AUDIO_OFFER)).await;
    gateway.set(&gateway.state.fail_answer, true);

    let err = phone.answer().await.unwrap_err();
    assert!(matches!(err, WebphoneError::Negotiation { .. }));
    assert_eq!(
        gateway.last_sent().unwrap().message,
        SipRequest::Decline { code: Some(480) }
    );
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
    assert_eq!(phone.last_error().unwrap().kind, ErrorKind::Answer);
}

#[tokio::test]
async fn test_answer_without_call() {
    let (phone, _gateway) = registered_phone().await;
    let err = phone.answer().await.unwrap_err();
    assert!(matches!(err, WebphoneError::NoActiveCall));
}

#[tokio::test]
async fn test_hangup_while_ringing_declines() {
    let (phone, gateway) = ringing_phone(Some(AUDIO_OFFER)).await;

    phone.hangup().await.unwrap();
    assert_eq!(
        gateway.last_sent().unwrap().message,
        SipRequest::Decline { code: None }
    );
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
}

#[tokio::test]
async fn test_hangup_without_call_is_noop() {
    let (phone, gateway) = registered_phone().await;
    let before = gateway.sent().len();

    phone.hangup().await.unwrap();
    assert_eq!(gateway.sent().len(), before);
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
}

#[tokio::test]
async fn test_hangup_send_failure_still_idles() {
    let (phone, gateway) = in_call_phone().await;
    gateway.set(&gateway.state.fail_send, true);

    phone.hangup().await.unwrap();
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
    assert_eq!(gateway.state.local_hangups.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_hangup_keeps_reason() {
    let (phone, gateway) = in_call_phone().await;

    gateway.emit_sip(
        json!({ "event": "hangup", "code": 486, "reason": "Busy Here" }),
        None,
    );
    eventually("idle", || phone.extension_state() == ExtensionState::Idle).await;
    let status = phone.in_call_status();
    assert!(!status.in_call);
    assert_eq!(status.hangup_reason, "Busy Here");
}

#[tokio::test]
async fn test_rejected_remote_description_hangs_up() {
    let (phone, gateway) = registered_phone().await;
    phone.start_call("1001").await.unwrap();
    gateway.emit_event("calling");
    eventually("calling", || phone.extension_state() == ExtensionState::Calling).await;

    gateway.set(&gateway.state.fail_remote, true);
    gateway.emit_sip(json!({ "event": "accepted" }), Some(Jsep::answer("garbage")));

    eventually("error recorded", || phone.last_error().is_some()).await;
    assert_eq!(phone.last_error().unwrap().kind, ErrorKind::RemoteDescription);
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
    eventually("hangup sent", || gateway.count_sent("hangup") == 1).await;
    assert_eq!(gateway.state.local_hangups.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_updating_call_sends_update() {
    let (phone, gateway) = in_call_phone().await;

    gateway.emit_sip(
        json!({ "event": "updatingcall" }),
        Some(Jsep::offer(AUDIO_VIDEO_OFFER)),
    );
    eventually("update sent", || gateway.count_sent("update") == 1).await;

    let sent = gateway.last_sent().unwrap();
    assert_eq!(sent.jsep.map(|j| j.kind), Some("answer".to_string()));
    let (offer, media) = gateway.state.answers.lock().last().cloned().unwrap();
    assert_eq!(offer.sdp, AUDIO_VIDEO_OFFER);
    assert_eq!(media, MediaFlags::new(true, true));
    assert_eq!(phone.extension_state(), ExtensionState::InCall);
}

#[tokio::test]
async fn test_updating_call_failure_keeps_call() {
    let (phone, gateway) = in_call_phone().await;
    gateway.set(&gateway.state.fail_answer, true);

    gateway.emit_sip(json!({ "event": "updatingcall" }), Some(Jsep::offer(AUDIO_OFFER)));
    eventually("error recorded", || phone.last_error().is_some()).await;

    assert_eq!(phone.last_error().unwrap().kind, ErrorKind::UpdatingCall);
    assert_eq!(gateway.count_sent("update"), 0);
    assert_eq!(phone.extension_state(), ExtensionState::InCall);
}

#[tokio::test]
async fn test_second_incoming_call_is_busy() {
    let (phone, gateway) = ringing_phone(Some(AUDIO_OFFER)).await;

    gateway.emit_sip(
        json!({ "event": "incomingcall", "username": "sip:4001@pbx.example.com:5060" }),
        Some(Jsep::offer(AUDIO_OFFER)),
    );
    eventually("busy decline", || gateway.count_sent("decline") == 1).await;

    assert_eq!(
        gateway.last_sent().unwrap().message,
        SipRequest::Decline { code: Some(486) }
    );
    assert_eq!(phone.in_call_status().status.unwrap().number, "4000");
    assert_eq!(phone.extension_state(), ExtensionState::ReceivingCall);
}

#[tokio::test]
async fn test_in_call_controls() {
    let (phone, gateway) = in_call_phone().await;

    assert!(phone.toggle_mute().await.unwrap());
    assert!(phone.in_call_status().status.unwrap().muted);
    assert!(!phone.toggle_mute().await.unwrap());
    assert!(!phone.in_call_status().status.unwrap().muted);

    assert!(phone.toggle_hold().await.unwrap());
    assert_eq!(gateway.last_sent().unwrap().message, SipRequest::Hold);
    assert!(!phone.toggle_hold().await.unwrap());
    assert_eq!(gateway.last_sent().unwrap().message, SipRequest::Unhold);

    assert!(phone.toggle_speaker().unwrap());
    assert!(phone.in_call_status().status.unwrap().on_speaker);

    phone.send_dtmf("12#").await.unwrap();
    assert_eq!(gateway.state.dtmf.lock().as_slice(), ["12#".to_string()]);
}

#[tokio::test]
async fn test_hold_send_failure_keeps_flag() {
    let (phone, gateway) = in_call_phone().await;
    gateway.set(&gateway.state.fail_send, true);

    assert!(phone.toggle_hold().await.is_err());
    assert!(!phone.in_call_status().status.unwrap().on_hold);

    gateway.set(&gateway.state.fail_send, false);
    assert!(phone.toggle_hold().await.unwrap());
    assert!(phone.in_call_status().status.unwrap().on_hold);
    assert_eq!(gateway.last_sent().unwrap().message, SipRequest::Hold);
}

#[tokio::test]
async fn test_controls_need_a_call() {
    let (phone, _gateway) = registered_phone().await;

    assert!(matches!(phone.toggle_mute().await, Err(WebphoneError::NoActiveCall)));
    assert!(matches!(phone.toggle_hold().await, Err(WebphoneError::NoActiveCall)));
    assert!(matches!(phone.toggle_speaker(), Err(WebphoneError::NoActiveCall)));
}

#[tokio::test]
async fn test_plugin_error_is_recorded() {
    let (phone, gateway) = registered_phone().await;

    gateway.emit(GatewayEvent::Message {
        message: json!({ "error": "Missing element (uri)", "error_code": 440 }),
        jsep: None,
    });
    eventually("error recorded", || phone.last_error().is_some()).await;

    let error = phone.last_error().unwrap();
    assert_eq!(error.kind, ErrorKind::Plugin);
    assert_eq!(error.message, "Missing element (uri) (440)");
    assert_eq!(phone.extension_state(), ExtensionState::Idle);
}

#[tokio::test]
async fn test_losing_registration_drops_call() {
    let (phone, gateway) = in_call_phone().await;

    gateway.emit_event("unregistered");
    eventually("offline", || phone.extension_state() == ExtensionState::Offline).await;
    assert!(!phone.in_call_status().in_call);
}
