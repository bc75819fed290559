use std::sync::{Arc, PoisonError, RwLock};

use crate::participants::{ParticipantId, ParticipantView};
use crate::transport::{LinkKind, RemoteStream};

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    ConnectionStateChanged(ConnectionState),
    ParticipantListChanged(Vec<ParticipantView>),
    SpeakingChanged { user_id: ParticipantId, is_speaking: bool },
    MuteChanged { user_id: ParticipantId, is_muted: bool },
    DeafenChanged { user_id: ParticipantId, is_deafened: bool },
    ScreenShareChanged { user_id: ParticipantId, is_sharing: bool },
    RemoteStreamAvailable { user_id: ParticipantId, kind: LinkKind, stream: RemoteStream },
    Error(ErrorReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reason attached to a session-level `error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    DeviceUnavailable,
    ScreenShareDenied,
    NegotiationFailed { user_id: ParticipantId, kind: LinkKind },
    RelayDisconnected,
}

impl ErrorReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable => "device-unavailable",
            Self::ScreenShareDenied => "screen-share-denied",
            Self::NegotiationFailed { .. } => "negotiation-failed",
            Self::RelayDisconnected => "relay-disconnected",
        }
    }
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
///
/// `on_event` runs while the session holds its emission gate. It must not
/// call back into `ChannelSessionManager` synchronously; hand the event off
/// to another task or thread instead.
pub trait VoiceEventListener: Send + Sync {
    fn on_event(&self, event: VoiceEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn VoiceEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn VoiceEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: VoiceEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl VoiceEventListener for CountingListener {
        fn on_event(&self, _event: VoiceEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(VoiceEvent::ConnectionStateChanged(ConnectionState::Connected));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    struct EventCapture {
        events: Arc<Mutex<Vec<VoiceEvent>>>,
    }

    impl VoiceEventListener for EventCapture {
        fn on_event(&self, event: VoiceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn emitter_delivers_correct_events() {
        let emitter = EventEmitter::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        emitter.add_listener(Arc::new(EventCapture { events: events.clone() }));

        emitter.emit(VoiceEvent::SpeakingChanged {
            user_id: "p1".into(),
            is_speaking: true,
        });

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            VoiceEvent::SpeakingChanged { user_id, is_speaking } => {
                assert_eq!(user_id.as_str(), "p1");
                assert!(is_speaking);
            }
            other => panic!("expected SpeakingChanged, got {other:?}"),
        }
    }

    #[test]
    fn error_reason_codes_are_stable() {
        assert_eq!(ErrorReason::DeviceUnavailable.code(), "device-unavailable");
        assert_eq!(ErrorReason::ScreenShareDenied.code(), "screen-share-denied");
        assert_eq!(ErrorReason::RelayDisconnected.code(), "relay-disconnected");
        let failed = ErrorReason::NegotiationFailed {
            user_id: "p1".into(),
            kind: LinkKind::Audio,
        };
        assert_eq!(failed.code(), "negotiation-failed");
    }
}
