//! In-call controls: mute, hold, speaker and DTMF

use tracing::{info, warn};

use super::Webphone;
use crate::error::{WebphoneError, WebphoneResult};
use crate::messages::{PluginMessage, SipRequest};

impl Webphone {
    /// Flip the local microphone. No signaling is involved; the muted flag
    /// follows the gateway's audio mute state.
    pub async fn toggle_mute(&self) -> WebphoneResult<bool> {
        let handle = self.with_core(|core| {
            let handle = core.connection.handle().ok_or(WebphoneError::NotConnected)?;
            core.calls.session().ok_or(WebphoneError::NoActiveCall)?;
            Ok::<_, WebphoneError>(handle)
        })?;

        let was_muted = handle.is_audio_muted();
        if was_muted {
            handle.unmute_audio();
        } else {
            handle.mute_audio();
        }
        let muted = !was_muted;

        self.with_core(|core| {
            if let Some(session) = core.calls.session_mut() {
                session.muted = muted;
            }
        });
        info!(muted, "Toggled mute");
        Ok(muted)
    }

    /// Put the call on hold or resume it. The flag only flips once the
    /// request has been handed to the gateway.
    pub async fn toggle_hold(&self) -> WebphoneResult<bool> {
        let (handle, call_id, on_hold) = self.with_core(|core| {
            let handle = core.connection.handle().ok_or(WebphoneError::NotConnected)?;
            let session = core.calls.session().ok_or(WebphoneError::NoActiveCall)?;
            Ok::<_, WebphoneError>((handle, session.id, !session.on_hold))
        })?;

        let request = if on_hold {
            SipRequest::Hold
        } else {
            SipRequest::Unhold
        };
        let name = request.name();
        if let Err(e) = handle.send(PluginMessage::new(request)).await {
            warn!(request = name, error = %e, "Hold request failed");
            return Err(e.into());
        }

        self.with_core(|core| {
            if core.calls.is_current(call_id) {
                if let Some(session) = core.calls.session_mut() {
                    session.on_hold = on_hold;
                }
            }
        });
        info!(request = name, "Toggled hold");
        Ok(on_hold)
    }

    /// Flip the speaker flag of the active call. Purely local.
    pub fn toggle_speaker(&self) -> WebphoneResult<bool> {
        self.with_core(|core| {
            let session = core.calls.session_mut().ok_or(WebphoneError::NoActiveCall)?;
            session.on_speaker = !session.on_speaker;
            Ok(session.on_speaker)
        })
    }

    /// Send DTMF tones in-band. Fire and forget.
    pub async fn send_dtmf(&self, tones: &str) -> WebphoneResult<()> {
        let handle = self
            .with_core(|core| core.connection.handle())
            .ok_or(WebphoneError::NotConnected)?;
        info!(tones, "Sending DTMF");
        handle.dtmf(tones).await?;
        Ok(())
    }
}
