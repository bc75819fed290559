use thiserror::Error;

use crate::participants::ChannelId;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("already connected to channel {current}")]
    AlreadyConnected { current: ChannelId },
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(DeviceError),
    #[error("screen share denied")]
    ScreenShareDenied,
    #[error("signaling relay disconnected")]
    RelayDisconnected,
    #[error("relay error: {0}")]
    Relay(String),
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("join cancelled by leave")]
    JoinCancelled,
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure reported by a capture device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no capture device found")]
    NotFound,
    #[error("capture cancelled by user")]
    Cancelled,
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Failure of the underlying negotiation primitive for a single peer link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("negotiation failed: {0}")]
pub struct NegotiationError(pub String);

impl NegotiationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
