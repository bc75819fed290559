//! In-process relay, peer connector and capture devices.
//!
//! `LoopbackHub` plays the signaling server for any number of local
//! sessions: snapshot on register, presence fan-out, targeted signals.
//! Loopback connections "connect" once the initiator applies the answer,
//! reporting to both ends, and negotiation failures can be injected per
//! link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{DeviceError, NegotiationError, VoiceError};
use crate::media::{AudioConstraints, LocalTrack, MediaDevices, ScreenConstraints};
use crate::participants::{ChannelId, ParticipantId};
use crate::signaling::{
    IceCandidate, ParticipantSummary, RelayEvent, RelayMessage, RelayRegistration, SignalingRelay,
};
use crate::transport::{
    ConnectRequest, LinkKind, MediaKind, PeerConnection, PeerConnector, PeerEvent, PeerEventSink,
    RemoteStream,
};

type ConnectionKey = (ParticipantId, ParticipantId, LinkKind);

struct Registration {
    channel_id: ChannelId,
    events: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct HubState {
    /// Members per channel in join order.
    channels: HashMap<ChannelId, Vec<ParticipantSummary>>,
    registrations: HashMap<ParticipantId, Registration>,
    /// Latest connection per (owner, remote, kind).
    connections: HashMap<ConnectionKey, PeerEventSink>,
    /// Pending injected failures per (initiator, responder, initiator's kind).
    failures: HashMap<ConnectionKey, usize>,
    opened: usize,
    register_failure: Option<String>,
    register_delay: Option<Duration>,
}

impl HubState {
    /// Send to every other member of `channel_id`.
    fn broadcast(&self, channel_id: &ChannelId, from: &ParticipantId, event: RelayEvent) {
        for member in self.channels.get(channel_id).into_iter().flatten() {
            if &member.user_id == from {
                continue;
            }
            if let Some(reg) = self.registrations.get(&member.user_id) {
                let _ = reg.events.send(event.clone());
            }
        }
    }

    fn deliver(&self, to: &ParticipantId, channel_id: &ChannelId, event: RelayEvent) -> bool {
        match self.registrations.get(to) {
            Some(reg) if &reg.channel_id == channel_id => reg.events.send(event).is_ok(),
            _ => false,
        }
    }

    fn summary_mut(&mut self, user_id: &ParticipantId) -> Option<&mut ParticipantSummary> {
        let channel_id = &self.registrations.get(user_id)?.channel_id;
        self.channels
            .get_mut(channel_id)?
            .iter_mut()
            .find(|m| &m.user_id == user_id)
    }

    fn remove_member(&mut self, user_id: &ParticipantId) -> Option<ChannelId> {
        let reg = self.registrations.remove(user_id)?;
        if let Some(members) = self.channels.get_mut(&reg.channel_id) {
            members.retain(|m| &m.user_id != user_id);
        }
        self.broadcast(
            &reg.channel_id,
            user_id,
            RelayEvent::UserLeft {
                user_id: user_id.clone(),
                channel_id: reg.channel_id.clone(),
            },
        );
        Some(reg.channel_id)
    }
}

/// Shared in-process signaling server and connection registry.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn relay(&self, user_id: impl Into<ParticipantId>) -> Arc<LoopbackRelay> {
        Arc::new(LoopbackRelay {
            hub: self.clone(),
            user_id: user_id.into(),
        })
    }

    pub fn connector(&self, user_id: impl Into<ParticipantId>) -> Arc<LoopbackConnector> {
        Arc::new(LoopbackConnector {
            hub: self.clone(),
            owner: user_id.into(),
        })
    }

    /// Make the next `times` negotiations from `initiator` to `responder`
    /// on `kind` (as seen by the initiator) fail at both ends.
    pub fn fail_negotiation(
        &self,
        initiator: impl Into<ParticipantId>,
        responder: impl Into<ParticipantId>,
        kind: LinkKind,
        times: usize,
    ) {
        self.state()
            .failures
            .insert((initiator.into(), responder.into(), kind), times);
    }

    /// Refuse the next registration with a relay error.
    pub fn fail_register(&self, reason: impl Into<String>) {
        self.state().register_failure = Some(reason.into());
    }

    /// Hold every registration for `delay` before the hub sees it.
    pub fn delay_register(&self, delay: Duration) {
        self.state().register_delay = Some(delay);
    }

    /// Members of a channel as the relay sees them, in join order.
    pub fn members(&self, channel_id: &ChannelId) -> Vec<ParticipantSummary> {
        self.state().channels.get(channel_id).cloned().unwrap_or_default()
    }

    pub fn is_registered(&self, user_id: &ParticipantId) -> bool {
        self.state().registrations.contains_key(user_id)
    }

    /// Connections opened through any connector of this hub.
    pub fn connections_opened(&self) -> usize {
        self.state().opened
    }

    /// Deliver a raw event to one registered participant.
    pub fn inject(&self, to: &ParticipantId, event: RelayEvent) -> bool {
        let state = self.state();
        match state.registrations.get(to) {
            Some(reg) => reg.events.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop a participant's relay connection, as a server does when the
    /// socket dies. The participant's event stream closes and the others
    /// see them leave.
    pub fn disconnect(&self, user_id: &ParticipantId) {
        self.state().remove_member(user_id);
    }
}

/// One participant's view of the hub.
pub struct LoopbackRelay {
    hub: LoopbackHub,
    user_id: ParticipantId,
}

#[async_trait]
impl SignalingRelay for LoopbackRelay {
    async fn register(
        &self,
        channel_id: &ChannelId,
        local: &ParticipantSummary,
    ) -> Result<RelayRegistration, VoiceError> {
        let delay = self.hub.state().register_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.hub.state();
        if let Some(reason) = state.register_failure.take() {
            return Err(VoiceError::Relay(reason));
        }
        state.remove_member(&self.user_id);

        let (tx, events) = mpsc::unbounded_channel();
        let members = state.channels.entry(channel_id.clone()).or_default();
        let participants = members.clone();
        members.push(local.clone());
        state.registrations.insert(
            self.user_id.clone(),
            Registration {
                channel_id: channel_id.clone(),
                events: tx,
            },
        );
        state.broadcast(
            channel_id,
            &self.user_id,
            RelayEvent::UserJoined {
                user_id: self.user_id.clone(),
                channel_id: channel_id.clone(),
                display_name: local.display_name.clone(),
            },
        );
        Ok(RelayRegistration { participants, events })
    }

    async fn unregister(&self, channel_id: &ChannelId) -> Result<(), VoiceError> {
        let mut state = self.hub.state();
        if state
            .registrations
            .get(&self.user_id)
            .is_some_and(|r| &r.channel_id == channel_id)
        {
            state.remove_member(&self.user_id);
        }
        Ok(())
    }

    async fn send(&self, message: RelayMessage) -> Result<(), VoiceError> {
        let mut state = self.hub.state();
        let channel_id = match state.registrations.get(&self.user_id) {
            Some(reg) => reg.channel_id.clone(),
            None => return Err(VoiceError::RelayDisconnected),
        };
        let from = self.user_id.clone();

        match message {
            RelayMessage::Signal { to, channel_id: target, signal } => {
                state.deliver(
                    &to,
                    &target,
                    RelayEvent::Signal {
                        from,
                        channel_id: target.clone(),
                        signal,
                    },
                );
            }
            RelayMessage::ScreenSignal { to, channel_id: target, sharer, signal } => {
                state.deliver(
                    &to,
                    &target,
                    RelayEvent::ScreenSignal {
                        from,
                        channel_id: target.clone(),
                        sharer,
                        signal,
                    },
                );
            }
            RelayMessage::Muted { is_muted } => {
                if let Some(summary) = state.summary_mut(&from) {
                    summary.is_muted = is_muted;
                }
                state.broadcast(&channel_id, &from, RelayEvent::UserMuted { user_id: from.clone(), is_muted });
            }
            RelayMessage::Deafened { is_deafened } => {
                if let Some(summary) = state.summary_mut(&from) {
                    summary.is_deafened = is_deafened;
                }
                state.broadcast(
                    &channel_id,
                    &from,
                    RelayEvent::UserDeafened { user_id: from.clone(), is_deafened },
                );
            }
            RelayMessage::Speaking { is_speaking } => {
                state.broadcast(
                    &channel_id,
                    &from,
                    RelayEvent::UserSpeaking { user_id: from.clone(), is_speaking },
                );
            }
            RelayMessage::ScreenShareStarted { channel_id: target } => {
                if let Some(summary) = state.summary_mut(&from) {
                    summary.is_sharing_screen = true;
                }
                state.broadcast(
                    &target,
                    &from,
                    RelayEvent::ScreenShareStarted { user_id: from.clone(), channel_id: target.clone() },
                );
            }
            RelayMessage::ScreenShareStopped { channel_id: target } => {
                if let Some(summary) = state.summary_mut(&from) {
                    summary.is_sharing_screen = false;
                }
                state.broadcast(
                    &target,
                    &from,
                    RelayEvent::ScreenShareStopped { user_id: from.clone(), channel_id: target.clone() },
                );
            }
        }
        Ok(())
    }
}

/// Opens loopback connections owned by one participant.
pub struct LoopbackConnector {
    hub: LoopbackHub,
    owner: ParticipantId,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn open(
        &self,
        request: ConnectRequest,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let key = (self.owner.clone(), request.remote.clone(), request.kind);
        {
            let mut state = self.hub.state();
            state.connections.insert(key.clone(), events.clone());
            state.opened += 1;
        }
        Ok(Arc::new(LoopbackConnection {
            hub: self.hub.clone(),
            key,
            events,
            closed: AtomicBool::new(false),
            candidates: AtomicUsize::new(0),
        }))
    }
}

pub struct LoopbackConnection {
    hub: LoopbackHub,
    key: ConnectionKey,
    events: PeerEventSink,
    closed: AtomicBool,
    candidates: AtomicUsize,
}

impl LoopbackConnection {
    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host", self.events.generation()),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::new("connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.ensure_open()?;
        self.events.emit(PeerEvent::LocalCandidate(self.local_candidate()));
        Ok(format!("v=0 loopback offer {}", self.events.generation()))
    }

    async fn accept_offer(&self, _sdp: &str) -> Result<String, NegotiationError> {
        self.ensure_open()?;
        self.events.emit(PeerEvent::LocalCandidate(self.local_candidate()));
        Ok(format!("v=0 loopback answer {}", self.events.generation()))
    }

    async fn accept_answer(&self, _sdp: &str) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let (owner, remote, kind) = &self.key;
        let mut state = self.hub.state();
        let remote_key = (remote.clone(), owner.clone(), kind.mirrored());
        let remote_sink = state.connections.get(&remote_key).cloned();

        let fail = match state.failures.get_mut(&self.key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        if fail {
            self.events.emit(PeerEvent::Failed("injected ice failure".into()));
            if let Some(sink) = remote_sink {
                sink.emit(PeerEvent::Failed("injected ice failure".into()));
            }
            return Ok(());
        }

        self.events
            .emit(PeerEvent::Connected(RemoteStream::new(format!("{remote}-{}", Uuid::new_v4()))));
        if let Some(sink) = remote_sink {
            sink.emit(PeerEvent::Connected(RemoteStream::new(format!("{owner}-{}", Uuid::new_v4()))));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.hub.state();
        if state
            .connections
            .get(&self.key)
            .is_some_and(|sink| sink.generation() == self.events.generation())
        {
            state.connections.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct DeviceState {
    microphone_error: Option<DeviceError>,
    display_error: Option<DeviceError>,
    microphone_delay: Option<Duration>,
    microphones: Vec<LocalTrack>,
    displays: Vec<LocalTrack>,
}

/// Scripted capture devices.
#[derive(Default)]
pub struct LoopbackDevices {
    state: Mutex<DeviceState>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn deny_microphone(&self, error: DeviceError) {
        self.state().microphone_error = Some(error);
    }

    pub fn deny_display(&self, error: DeviceError) {
        self.state().display_error = Some(error);
    }

    pub fn allow_display(&self) {
        self.state().display_error = None;
    }

    /// Hold microphone acquisition for `delay`, like a pending permission prompt.
    pub fn delay_microphone(&self, delay: Duration) {
        self.state().microphone_delay = Some(delay);
    }

    pub fn last_microphone(&self) -> Option<LocalTrack> {
        self.state().microphones.last().cloned()
    }

    pub fn last_display(&self) -> Option<LocalTrack> {
        self.state().displays.last().cloned()
    }

    pub fn microphones_opened(&self) -> usize {
        self.state().microphones.len()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn open_microphone(&self, _constraints: AudioConstraints) -> Result<LocalTrack, DeviceError> {
        let delay = self.state().microphone_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(error) = state.microphone_error.clone() {
            return Err(error);
        }
        let track = LocalTrack::new(MediaKind::Audio);
        state.microphones.push(track.clone());
        Ok(track)
    }

    async fn open_display(&self, _constraints: ScreenConstraints) -> Result<LocalTrack, DeviceError> {
        let mut state = self.state();
        if let Some(error) = state.display_error.clone() {
            return Err(error);
        }
        let track = LocalTrack::new(MediaKind::Screen);
        state.displays.push(track.clone());
        Ok(track)
    }
}
