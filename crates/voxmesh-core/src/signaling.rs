//! Signaling relay protocol.
//!
//! The relay is a channel-scoped message bus: every frame is a named event
//! with a JSON payload. Payloads are decoded into typed events at this
//! boundary; SDP and ICE contents stay opaque strings that are handed to
//! the negotiation primitive untouched.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::VoiceError;
use crate::participants::{ChannelId, ParticipantId};

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub mod events {
    pub const JOIN_VOICE_CHANNEL: &str = "joinVoiceChannel";
    pub const LEAVE_VOICE_CHANNEL: &str = "leaveVoiceChannel";
    pub const VOICE_CHANNEL_STATE: &str = "voiceChannelState";
    pub const USER_JOINED_VOICE: &str = "userJoinedVoice";
    pub const USER_LEFT_VOICE: &str = "userLeftVoice";
    pub const VOICE_SIGNAL: &str = "voice-signal";
    pub const VOICE_USER_MUTED: &str = "voice-user-muted";
    pub const VOICE_USER_DEAFENED: &str = "voice-user-deafened";
    pub const VOICE_USER_SPEAKING: &str = "voice-user-speaking";
    pub const SCREEN_SHARE_STARTED: &str = "screen-share-started";
    pub const SCREEN_SHARE_STOPPED: &str = "screen-share-stopped";
    pub const SCREEN_SIGNAL: &str = "screen-signal";
}

// ---------------------------------------------------------------------------
// Signal payloads
// ---------------------------------------------------------------------------

/// Connection-setup payload exchanged between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    fn validate(&self) -> Result<(), VoiceError> {
        match self {
            Self::Offer { sdp } | Self::Answer { sdp } if sdp.trim().is_empty() => {
                Err(VoiceError::InvalidSignal("empty session description".into()))
            }
            Self::Candidate { candidate } if candidate.candidate.trim().is_empty() => {
                Err(VoiceError::InvalidSignal("empty ice candidate".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u32>,
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// A single relay frame: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RelayFrame {
    fn new(event: &str, data: impl Serialize) -> Result<Self, VoiceError> {
        let data = serde_json::to_value(data)
            .map_err(|e| VoiceError::Relay(format!("encode {event}: {e}")))?;
        Ok(Self {
            event: event.to_string(),
            data,
        })
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, VoiceError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| VoiceError::InvalidSignal(format!("{}: {e}", self.event)))
    }

    pub fn join(channel_id: &ChannelId, participant: &ParticipantSummary) -> Result<Self, VoiceError> {
        Self::new(
            events::JOIN_VOICE_CHANNEL,
            JoinRequest {
                channel_id: channel_id.clone(),
                participant: participant.clone(),
            },
        )
    }

    pub fn leave(channel_id: &ChannelId, user_id: &ParticipantId) -> Result<Self, VoiceError> {
        Self::new(
            events::LEAVE_VOICE_CHANNEL,
            MemberPayload {
                user_id: user_id.clone(),
                channel_id: channel_id.clone(),
            },
        )
    }

    pub fn channel_state(channel_id: &ChannelId, participants: Vec<ParticipantSummary>) -> Result<Self, VoiceError> {
        Self::new(
            events::VOICE_CHANNEL_STATE,
            ChannelStatePayload {
                channel_id: channel_id.clone(),
                participants,
            },
        )
    }

    /// Decode a `joinVoiceChannel` request, as a relay server sees it.
    pub fn into_join_request(self) -> Result<(ChannelId, ParticipantSummary), VoiceError> {
        if self.event != events::JOIN_VOICE_CHANNEL {
            return Err(VoiceError::InvalidSignal(format!(
                "expected {}, got {}",
                events::JOIN_VOICE_CHANNEL,
                self.event
            )));
        }
        let request: JoinRequest = self.payload()?;
        Ok((request.channel_id, request.participant))
    }

    /// Decode a `voiceChannelState` snapshot frame.
    pub fn into_channel_state(self) -> Result<ChannelStatePayload, VoiceError> {
        if self.event != events::VOICE_CHANNEL_STATE {
            return Err(VoiceError::InvalidSignal(format!(
                "expected {}, got {}",
                events::VOICE_CHANNEL_STATE,
                self.event
            )));
        }
        self.payload()
    }
}

/// Status of a channel member as known to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub user_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_deafened: bool,
    #[serde(default)]
    pub is_sharing_screen: bool,
}

impl ParticipantSummary {
    pub fn new(user_id: ParticipantId) -> Self {
        Self {
            user_id,
            display_name: None,
            is_muted: false,
            is_deafened: false,
            is_sharing_screen: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    channel_id: ChannelId,
    participant: ParticipantSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatePayload {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub participants: Vec<ParticipantSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresencePayload {
    user_id: ParticipantId,
    channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalEnvelope {
    signal: SignalPayload,
    user_id: ParticipantId,
    channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sharer_id: Option<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutePayload {
    user_id: ParticipantId,
    is_muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeafenPayload {
    user_id: ParticipantId,
    is_deafened: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeakingPayload {
    user_id: ParticipantId,
    is_speaking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberPayload {
    user_id: ParticipantId,
    channel_id: ChannelId,
}

// ---------------------------------------------------------------------------
// Typed events
// ---------------------------------------------------------------------------

/// Inbound relay event, already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    UserJoined {
        user_id: ParticipantId,
        channel_id: ChannelId,
        display_name: Option<String>,
    },
    UserLeft {
        user_id: ParticipantId,
        channel_id: ChannelId,
    },
    Signal {
        from: ParticipantId,
        channel_id: ChannelId,
        signal: SignalPayload,
    },
    ScreenSignal {
        from: ParticipantId,
        channel_id: ChannelId,
        sharer: ParticipantId,
        signal: SignalPayload,
    },
    UserMuted { user_id: ParticipantId, is_muted: bool },
    UserDeafened { user_id: ParticipantId, is_deafened: bool },
    UserSpeaking { user_id: ParticipantId, is_speaking: bool },
    ScreenShareStarted { user_id: ParticipantId, channel_id: ChannelId },
    ScreenShareStopped { user_id: ParticipantId, channel_id: ChannelId },
    /// The relay connection is gone. Session-fatal.
    Disconnected,
}

impl RelayEvent {
    /// Decode an inbound frame. Unknown event names yield `Ok(None)`.
    pub fn decode(frame: &RelayFrame) -> Result<Option<Self>, VoiceError> {
        let event = match frame.event.as_str() {
            events::USER_JOINED_VOICE => {
                let p: PresencePayload = frame.payload()?;
                Self::UserJoined {
                    user_id: p.user_id,
                    channel_id: p.channel_id,
                    display_name: p.display_name,
                }
            }
            events::USER_LEFT_VOICE => {
                let p: PresencePayload = frame.payload()?;
                Self::UserLeft {
                    user_id: p.user_id,
                    channel_id: p.channel_id,
                }
            }
            events::VOICE_SIGNAL => {
                let p: SignalEnvelope = frame.payload()?;
                p.signal.validate()?;
                Self::Signal {
                    from: p.user_id,
                    channel_id: p.channel_id,
                    signal: p.signal,
                }
            }
            events::SCREEN_SIGNAL => {
                let p: SignalEnvelope = frame.payload()?;
                p.signal.validate()?;
                Self::ScreenSignal {
                    sharer: p.sharer_id.unwrap_or_else(|| p.user_id.clone()),
                    from: p.user_id,
                    channel_id: p.channel_id,
                    signal: p.signal,
                }
            }
            events::VOICE_USER_MUTED => {
                let p: MutePayload = frame.payload()?;
                Self::UserMuted {
                    user_id: p.user_id,
                    is_muted: p.is_muted,
                }
            }
            events::VOICE_USER_DEAFENED => {
                let p: DeafenPayload = frame.payload()?;
                Self::UserDeafened {
                    user_id: p.user_id,
                    is_deafened: p.is_deafened,
                }
            }
            events::VOICE_USER_SPEAKING => {
                let p: SpeakingPayload = frame.payload()?;
                Self::UserSpeaking {
                    user_id: p.user_id,
                    is_speaking: p.is_speaking,
                }
            }
            events::SCREEN_SHARE_STARTED => {
                let p: MemberPayload = frame.payload()?;
                Self::ScreenShareStarted {
                    user_id: p.user_id,
                    channel_id: p.channel_id,
                }
            }
            events::SCREEN_SHARE_STOPPED => {
                let p: MemberPayload = frame.payload()?;
                Self::ScreenShareStopped {
                    user_id: p.user_id,
                    channel_id: p.channel_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Outbound message from the local participant.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Signal {
        to: ParticipantId,
        channel_id: ChannelId,
        signal: SignalPayload,
    },
    ScreenSignal {
        to: ParticipantId,
        channel_id: ChannelId,
        sharer: ParticipantId,
        signal: SignalPayload,
    },
    Muted { is_muted: bool },
    Deafened { is_deafened: bool },
    Speaking { is_speaking: bool },
    ScreenShareStarted { channel_id: ChannelId },
    ScreenShareStopped { channel_id: ChannelId },
}

impl RelayMessage {
    /// Encode for the wire. Signals address the target in `userId`; status
    /// broadcasts carry the sender's own id.
    pub fn encode(&self, local: &ParticipantId) -> Result<RelayFrame, VoiceError> {
        match self {
            Self::Signal { to, channel_id, signal } => RelayFrame::new(
                events::VOICE_SIGNAL,
                SignalEnvelope {
                    signal: signal.clone(),
                    user_id: to.clone(),
                    channel_id: channel_id.clone(),
                    sharer_id: None,
                },
            ),
            Self::ScreenSignal { to, channel_id, sharer, signal } => RelayFrame::new(
                events::SCREEN_SIGNAL,
                SignalEnvelope {
                    signal: signal.clone(),
                    user_id: to.clone(),
                    channel_id: channel_id.clone(),
                    sharer_id: Some(sharer.clone()),
                },
            ),
            Self::Muted { is_muted } => RelayFrame::new(
                events::VOICE_USER_MUTED,
                MutePayload {
                    user_id: local.clone(),
                    is_muted: *is_muted,
                },
            ),
            Self::Deafened { is_deafened } => RelayFrame::new(
                events::VOICE_USER_DEAFENED,
                DeafenPayload {
                    user_id: local.clone(),
                    is_deafened: *is_deafened,
                },
            ),
            Self::Speaking { is_speaking } => RelayFrame::new(
                events::VOICE_USER_SPEAKING,
                SpeakingPayload {
                    user_id: local.clone(),
                    is_speaking: *is_speaking,
                },
            ),
            Self::ScreenShareStarted { channel_id } => RelayFrame::new(
                events::SCREEN_SHARE_STARTED,
                MemberPayload {
                    user_id: local.clone(),
                    channel_id: channel_id.clone(),
                },
            ),
            Self::ScreenShareStopped { channel_id } => RelayFrame::new(
                events::SCREEN_SHARE_STOPPED,
                MemberPayload {
                    user_id: local.clone(),
                    channel_id: channel_id.clone(),
                },
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay seam
// ---------------------------------------------------------------------------

/// Result of registering presence in a channel.
#[derive(Debug)]
pub struct RelayRegistration {
    /// Members already present, in the relay's join order.
    pub participants: Vec<ParticipantSummary>,
    /// Inbound events for this channel. Closing the stream means the relay is gone.
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Bidirectional, channel-scoped message bus between clients.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn register(
        &self,
        channel_id: &ChannelId,
        local: &ParticipantSummary,
    ) -> Result<RelayRegistration, VoiceError>;

    async fn unregister(&self, channel_id: &ChannelId) -> Result<(), VoiceError>;

    async fn send(&self, message: RelayMessage) -> Result<(), VoiceError>;
}
