//! Media negotiation helpers
//!
//! Wraps offer/answer creation on the SIP handle and decides which media
//! kinds to request by inspecting the remote SDP.

use crate::error::{WebphoneError, WebphoneResult};
use crate::gateway::{Jsep, MediaFlags, PluginHandle};

/// Media kinds found in a remote offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPresence {
    pub audio: bool,
    pub video: bool,
}

impl MediaPresence {
    pub fn flags(&self) -> MediaFlags {
        MediaFlags::new(self.audio, self.video)
    }
}

/// How an inbound call gets answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerPlan {
    /// Answer the pending remote offer
    Answer { offer: Jsep, media: MediaFlags },
    /// The INVITE came without SDP; send our own offer, audio only
    Offerless { media: MediaFlags },
}

/// Stateless negotiation helpers over a [`PluginHandle`]
pub struct MediaNegotiator;

impl MediaNegotiator {
    /// Strict inspection used when answering: matches media lines only
    /// (`m=audio `, `m=video `), never header names.
    pub fn answer_presence(sdp: &str) -> MediaPresence {
        MediaPresence {
            audio: sdp.contains("m=audio "),
            video: sdp.contains("m=video "),
        }
    }

    /// Loose inspection used for mid-call updates
    pub fn update_presence(sdp: &str) -> MediaPresence {
        MediaPresence {
            audio: sdp.contains("m=audio"),
            video: sdp.contains("m=video"),
        }
    }

    /// Plan the answer for an inbound call
    pub fn plan_answer(pending_offer: Option<Jsep>) -> AnswerPlan {
        match pending_offer {
            Some(offer) => {
                let media = Self::answer_presence(&offer.sdp).flags();
                AnswerPlan::Answer { offer, media }
            }
            None => AnswerPlan::Offerless {
                media: MediaFlags::new(true, false),
            },
        }
    }

    /// Flags for an outbound call. Video is always off.
    pub fn outbound_flags() -> MediaFlags {
        MediaFlags::audio_only()
    }

    /// Execute an answer plan
    pub async fn execute(handle: &dyn PluginHandle, plan: &AnswerPlan) -> WebphoneResult<Jsep> {
        match plan {
            AnswerPlan::Answer { offer, media } => Self::create_answer(handle, offer, *media).await,
            AnswerPlan::Offerless { media } => Self::create_offer(handle, *media).await,
        }
    }

    pub async fn create_offer(
        handle: &dyn PluginHandle,
        media: MediaFlags,
    ) -> WebphoneResult<Jsep> {
        let jsep = handle
            .create_offer(media)
            .await
            .map_err(|e| WebphoneError::negotiation(e.reason))?;
        tracing::debug!(
            kind = %jsep.kind,
            audio = media.has_audio(),
            video = media.has_video(),
            "Got local SDP"
        );
        Ok(jsep)
    }

    pub async fn create_answer(
        handle: &dyn PluginHandle,
        offer: &Jsep,
        media: MediaFlags,
    ) -> WebphoneResult<Jsep> {
        let jsep = handle
            .create_answer(offer, media)
            .await
            .map_err(|e| WebphoneError::negotiation(e.reason))?;
        tracing::debug!(
            kind = %jsep.kind,
            audio = media.has_audio(),
            video = media.has_video(),
            "Got local SDP"
        );
        Ok(jsep)
    }

    /// Apply a remote description carried by a signaling event
    pub async fn apply_remote(handle: &dyn PluginHandle, jsep: &Jsep) -> WebphoneResult<()> {
        handle
            .handle_remote_jsep(jsep)
            .await
            .map_err(|e| WebphoneError::signaling_handling(e.reason))
    }
}
