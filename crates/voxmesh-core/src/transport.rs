//! Seam to the real-time media transport.
//!
//! The pool only drives the offer/answer/candidate sequence; codecs, ICE
//! and media flow live behind `PeerConnector` and `PeerConnection`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::NegotiationError;
use crate::media::LocalTrack;
use crate::participants::ParticipantId;
use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Screen,
}

/// Which link to a participant: the audio mesh link, or a screen link
/// in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkKind {
    Audio,
    /// Local screen sent to the participant.
    OutboundScreen,
    /// Participant's screen received locally.
    InboundScreen,
}

impl LinkKind {
    /// The kind of the same link as seen from the other end.
    pub fn mirrored(self) -> Self {
        match self {
            Self::Audio => Self::Audio,
            Self::OutboundScreen => Self::InboundScreen,
            Self::InboundScreen => Self::OutboundScreen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub participant: ParticipantId,
    pub kind: LinkKind,
}

impl LinkKey {
    pub fn new(participant: ParticipantId, kind: LinkKind) -> Self {
        Self { participant, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Inbound media from one remote participant.
///
/// Audio can be silenced locally without touching the negotiated connection.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    audio_enabled: Arc<AtomicBool>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio_enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Asynchronous output of a connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Connected(RemoteStream),
    Failed(String),
}

/// A `PeerEvent` tagged with the link and connection generation it came from.
#[derive(Debug, Clone)]
pub struct PeerInput {
    pub key: LinkKey,
    pub generation: Uuid,
    pub event: PeerEvent,
}

/// Handle given to a connection so it can report events back by id.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    key: LinkKey,
    generation: Uuid,
    tx: mpsc::UnboundedSender<PeerInput>,
}

impl PeerEventSink {
    pub(crate) fn new(key: LinkKey, generation: Uuid, tx: mpsc::UnboundedSender<PeerInput>) -> Self {
        Self { key, generation, tx }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    /// Report an event. Events sent after the session is gone are dropped.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(PeerInput {
            key: self.key.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// What a new connection should carry.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub remote: ParticipantId,
    pub kind: LinkKind,
    pub role: Role,
    /// Local track to send, shared with every other link that sends it.
    pub outbound: Option<LocalTrack>,
}

/// Factory for connections to remote participants.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        request: ConnectRequest,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// One negotiated connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, NegotiationError>;

    async fn accept_answer(&self, sdp: &str) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    fn close(&self);
}
