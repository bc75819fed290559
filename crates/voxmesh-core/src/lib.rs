//! Voxmesh core: peer-mesh voice channel sessions.
//!
//! Pure Rust crate with no platform dependencies. The capture devices,
//! the peer connection primitive and the signaling relay are traits; hosts
//! plug in their platform implementations and drive a
//! `ChannelSessionManager` from their UI.

pub mod errors;
pub mod events;
pub mod logging;
pub mod media;
pub mod participants;
pub mod pool;
pub mod session;
pub mod settings;
pub mod signaling;
pub mod transport;
pub mod vad;
pub mod ws_relay;

#[cfg(any(test, feature = "loopback"))]
pub mod loopback;

pub use errors::{DeviceError, NegotiationError, VoiceError};
pub use events::{ConnectionState, ErrorReason, VoiceEvent, VoiceEventListener};
pub use participants::{ChannelId, ParticipantId, ParticipantView};
pub use session::{ChannelSessionManager, SessionConfig};
pub use settings::{SettingsStore, VoiceSettings};
