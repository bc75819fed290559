//! Voice channel session: the one place that decides whether we are
//! connected, to which channel, and with whom.
//!
//! Every join starts a new epoch. Work that suspends (device access, relay
//! registration, negotiation) re-checks the epoch when it resumes, so a
//! `leave` racing a `join` always wins. Listener emission goes through a
//! gate that `leave` closes before returning.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::VoiceError;
use crate::events::{ConnectionState, ErrorReason, EventEmitter, VoiceEvent, VoiceEventListener};
use crate::media::{AudioConstraints, LocalTrack, MediaDevices, MediaTrackController, ScreenQuality};
use crate::participants::{ChannelId, ParticipantId, ParticipantRoster, ParticipantView};
use crate::pool::{PeerConnectionPool, PeerLinkSnapshot, PoolHealth, PoolNotice};
use crate::signaling::{ParticipantSummary, RelayEvent, RelayMessage, SignalingRelay};
use crate::transport::{LinkKey, LinkKind, PeerConnector, PeerInput, RemoteStream, Role};
use crate::vad::{VadConfig, VoiceActivityDetector};

/// Per-session settings, usually derived from `VoiceSettings`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub display_name: Option<String>,
    pub audio: AudioConstraints,
    /// Preset used when `start_screen_share` is called without one.
    pub screen_quality: ScreenQuality,
    pub vad: VadConfig,
    /// Join with the microphone disabled and announce it in the join request.
    pub join_muted: bool,
}

enum ControlInput {
    /// Edge from the local voice activity detector.
    LocalSpeaking(bool),
    /// Members present at registration, for responder links.
    Bootstrap(Vec<ParticipantSummary>),
    ScreenStarted,
    /// The capture track ended, by request or out-of-band.
    ScreenEnded { track_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Teardown {
    Leave,
    RelayLost,
    JoinFailed(Option<ErrorReason>),
}

#[derive(Default)]
struct SessionTasks {
    event_loop: Option<JoinHandle<()>>,
    vad: Option<JoinHandle<()>>,
    screen_watch: Option<JoinHandle<()>>,
}

struct SessionInner {
    epoch: u64,
    channel_id: Option<ChannelId>,
    state: ConnectionState,
    local_mute: bool,
    local_deafen: bool,
    /// Id of the capture track being shared.
    screen_track: Option<String>,
    roster: ParticipantRoster,
    pool: Option<PeerConnectionPool>,
    control_tx: Option<mpsc::UnboundedSender<ControlInput>>,
    tasks: SessionTasks,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            epoch: 0,
            channel_id: None,
            state: ConnectionState::Disconnected,
            local_mute: false,
            local_deafen: false,
            screen_track: None,
            roster: ParticipantRoster::new(),
            pool: None,
            control_tx: None,
            tasks: SessionTasks::default(),
        }
    }

    fn is_connected(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state == ConnectionState::Connected
    }
}

struct SessionCore {
    local_id: ParticipantId,
    config: SessionConfig,
    relay: Arc<dyn SignalingRelay>,
    connector: Arc<dyn PeerConnector>,
    media: MediaTrackController,
    emitter: EventEmitter,
    /// Epoch allowed to reach listeners, 0 when none. Lock before `inner`.
    gate: RwLock<u64>,
    inner: Mutex<SessionInner>,
}

/// Handle to the local voice session. Cheap to clone; every clone drives
/// the same session.
#[derive(Clone)]
pub struct ChannelSessionManager {
    core: Arc<SessionCore>,
}

impl ChannelSessionManager {
    pub fn new(
        local_id: impl Into<ParticipantId>,
        config: SessionConfig,
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                local_id: local_id.into(),
                config,
                relay,
                connector,
                media: MediaTrackController::new(devices),
                emitter: EventEmitter::new(),
                gate: RwLock::new(0),
                inner: Mutex::new(SessionInner::new()),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn VoiceEventListener>) {
        self.core.emitter.add_listener(listener);
    }

    // -----------------------------------------------------------------------
    // Join / leave
    // -----------------------------------------------------------------------

    /// Join a voice channel.
    ///
    /// Returns once the relay has accepted the registration; peer links
    /// negotiate afterwards. Joining the channel already joined is a no-op.
    pub async fn join(&self, channel_id: impl Into<ChannelId>) -> Result<(), VoiceError> {
        let core = &self.core;
        let channel_id = channel_id.into();

        let (epoch, control_tx, control_rx) = {
            let mut gate = core.write_gate();
            let mut inner = core.lock();
            if let Some(current) = &inner.channel_id {
                if *current == channel_id {
                    debug!(channel = %channel_id, "already in channel");
                    return Ok(());
                }
                return Err(VoiceError::AlreadyConnected { current: current.clone() });
            }
            inner.epoch += 1;
            *gate = inner.epoch;
            inner.channel_id = Some(channel_id.clone());
            inner.state = ConnectionState::Connecting;
            inner.local_mute = core.config.join_muted;
            inner.local_deafen = false;
            let (tx, rx) = mpsc::unbounded_channel();
            inner.control_tx = Some(tx.clone());
            (inner.epoch, tx, rx)
        };
        info!(channel = %channel_id, "joining voice channel");
        core.emit_gated(epoch, VoiceEvent::ConnectionStateChanged(ConnectionState::Connecting));

        // 1. Microphone. No relay contact until we have one.
        let track = match core.media.acquire_microphone(core.config.audio).await {
            Ok(track) => track,
            Err(e) => {
                let current = core
                    .teardown(Some(epoch), Teardown::JoinFailed(Some(ErrorReason::DeviceUnavailable)))
                    .is_some();
                return Err(if current { e } else { VoiceError::JoinCancelled });
            }
        };

        let started = {
            let mut inner = core.lock();
            if inner.epoch == epoch {
                core.media.set_microphone_enabled(!inner.local_mute);
                inner.tasks.vad = Some(core.spawn_vad(track.clone(), control_tx.clone()));
                true
            } else {
                false
            }
        };
        if !started {
            core.discard_if_idle(&track);
            return Err(VoiceError::JoinCancelled);
        }

        // 2. Presence.
        let summary = ParticipantSummary {
            display_name: core.config.display_name.clone(),
            is_muted: core.config.join_muted,
            ..ParticipantSummary::new(core.local_id.clone())
        };
        let registration = match core.relay.register(&channel_id, &summary).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(channel = %channel_id, "relay registration failed: {e}");
                if let Err(e) = core.relay.unregister(&channel_id).await {
                    debug!("unregister after failed join: {e}");
                }
                let current = core.teardown(Some(epoch), Teardown::JoinFailed(None)).is_some();
                return Err(if current { e } else { VoiceError::JoinCancelled });
            }
        };

        // 3. Roster and links.
        let snapshot: Vec<ParticipantSummary> = registration
            .participants
            .into_iter()
            .filter(|p| p.user_id != core.local_id)
            .collect();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let pool = PeerConnectionPool::new(
            core.local_id.clone(),
            channel_id.clone(),
            Arc::clone(&core.connector),
            Arc::clone(&core.relay),
            Some(track.clone()),
            peer_tx,
        );

        let views = {
            let mut inner = core.lock();
            if inner.epoch == epoch {
                let mut local = ParticipantView::local(core.local_id.clone(), core.config.display_name.clone());
                local.is_muted = inner.local_mute;
                inner.roster.clear();
                inner.roster.set_local(local);
                for member in &snapshot {
                    inner.roster.add(view_from_summary(member));
                }
                inner.pool = Some(pool.clone());
                inner.state = ConnectionState::Connected;
                Some(inner.roster.views().to_vec())
            } else {
                None
            }
        };
        let Some(views) = views else {
            pool.close_all();
            if let Err(e) = core.relay.unregister(&channel_id).await {
                debug!("unregister after cancelled join: {e}");
            }
            core.discard_if_idle(&track);
            return Err(VoiceError::JoinCancelled);
        };

        info!(channel = %channel_id, participants = views.len(), "joined voice channel");
        core.emit_gated(epoch, VoiceEvent::ConnectionStateChanged(ConnectionState::Connected));
        core.emit_gated(epoch, VoiceEvent::ParticipantListChanged(views));

        {
            let mut inner = core.lock();
            if inner.epoch != epoch {
                return Err(VoiceError::JoinCancelled);
            }
            // Queued ahead of any relay event so responder links exist first.
            let _ = control_tx.send(ControlInput::Bootstrap(snapshot));
            let event_loop = EventLoop {
                core: Arc::downgrade(&self.core),
                epoch,
                channel_id,
                pool,
            };
            inner.tasks.event_loop = Some(tokio::spawn(event_loop.run(control_rx, peer_rx, registration.events)));
        }
        Ok(())
    }

    /// Leave the channel. Safe in any state, including mid-join.
    ///
    /// No participant, speaking or link event reaches listeners once this
    /// returns, apart from the final disconnect notification.
    pub async fn leave(&self) {
        let Some(channel_id) = self.core.teardown(None, Teardown::Leave) else {
            return;
        };
        if let Err(e) = self.core.relay.unregister(&channel_id).await {
            warn!(channel = %channel_id, "relay unregister failed: {e}");
        }
        info!(channel = %channel_id, "left voice channel");
    }

    // -----------------------------------------------------------------------
    // Local controls
    // -----------------------------------------------------------------------

    /// Flip local mute. Returns the new state.
    pub async fn toggle_mute(&self) -> Result<bool, VoiceError> {
        let core = &self.core;
        let (epoch, muted) = {
            let mut inner = core.lock();
            if inner.state != ConnectionState::Connected {
                return Err(VoiceError::NotConnected);
            }
            inner.local_mute = !inner.local_mute;
            let muted = inner.local_mute;
            if let Some(local) = inner.roster.local_mut() {
                local.is_muted = muted;
            }
            core.media.set_microphone_enabled(!muted);
            (inner.epoch, muted)
        };
        info!(muted, "local mute toggled");
        core.emit_gated(epoch, VoiceEvent::MuteChanged {
            user_id: core.local_id.clone(),
            is_muted: muted,
        });
        core.send(RelayMessage::Muted { is_muted: muted }).await;
        Ok(muted)
    }

    /// Flip local deafen. Deafening also mutes; un-deafening leaves mute
    /// as it is. Returns the new deafen state.
    pub async fn toggle_deafen(&self) -> Result<bool, VoiceError> {
        let core = &self.core;
        let (epoch, deafened, forced_mute) = {
            let mut inner = core.lock();
            if inner.state != ConnectionState::Connected {
                return Err(VoiceError::NotConnected);
            }
            inner.local_deafen = !inner.local_deafen;
            let deafened = inner.local_deafen;
            let forced_mute = deafened && !inner.local_mute;
            if forced_mute {
                inner.local_mute = true;
            }
            let muted = inner.local_mute;
            if let Some(local) = inner.roster.local_mut() {
                local.is_deafened = deafened;
                local.is_muted = muted;
            }
            core.media.set_microphone_enabled(!muted);
            if let Some(pool) = &inner.pool {
                pool.set_inbound_audio_enabled(!deafened);
            }
            (inner.epoch, deafened, forced_mute)
        };
        info!(deafened, "local deafen toggled");

        if forced_mute {
            core.emit_gated(epoch, VoiceEvent::MuteChanged {
                user_id: core.local_id.clone(),
                is_muted: true,
            });
            core.send(RelayMessage::Muted { is_muted: true }).await;
        }
        core.emit_gated(epoch, VoiceEvent::DeafenChanged {
            user_id: core.local_id.clone(),
            is_deafened: deafened,
        });
        core.send(RelayMessage::Deafened { is_deafened: deafened }).await;
        Ok(deafened)
    }

    /// Share the screen with every participant, present and future.
    ///
    /// A refused capture is reported as `ScreenShareDenied`, both returned
    /// and emitted; the voice session carries on.
    pub async fn start_screen_share(&self, quality: Option<ScreenQuality>) -> Result<(), VoiceError> {
        let core = &self.core;
        let (epoch, channel_id) = {
            let inner = core.lock();
            match (&inner.channel_id, inner.state) {
                (Some(channel_id), ConnectionState::Connected) => {
                    if inner.screen_track.is_some() {
                        return Ok(());
                    }
                    (inner.epoch, channel_id.clone())
                }
                _ => return Err(VoiceError::NotConnected),
            }
        };

        let quality = quality.unwrap_or(core.config.screen_quality);
        let track = match core.media.start_screen_share(quality).await {
            Ok(track) => track,
            Err(e) => {
                let reason = match e {
                    VoiceError::ScreenShareDenied => ErrorReason::ScreenShareDenied,
                    _ => ErrorReason::DeviceUnavailable,
                };
                core.emit_gated(epoch, VoiceEvent::Error(reason));
                return Err(e);
            }
        };

        let control_tx = {
            let mut inner = core.lock();
            if !inner.is_connected(epoch) {
                None
            } else {
                inner.screen_track = Some(track.id().to_string());
                if let Some(local) = inner.roster.local_mut() {
                    local.is_sharing_screen = true;
                }
                if let Some(pool) = &inner.pool {
                    pool.set_local_screen(Some(track.clone()));
                }
                let control_tx = inner.control_tx.clone();
                if let Some(tx) = control_tx.clone() {
                    let watched = track.clone();
                    let watcher = tokio::spawn(async move {
                        watched.ended().await;
                        let _ = tx.send(ControlInput::ScreenEnded {
                            track_id: watched.id().to_string(),
                        });
                    });
                    if let Some(previous) = inner.tasks.screen_watch.replace(watcher) {
                        previous.abort();
                    }
                }
                control_tx
            }
        };
        let Some(control_tx) = control_tx else {
            core.media.discard(&track);
            return Err(VoiceError::NotConnected);
        };

        info!(?quality, "screen share started");
        core.send(RelayMessage::ScreenShareStarted { channel_id }).await;
        core.emit_gated(epoch, VoiceEvent::ScreenShareChanged {
            user_id: core.local_id.clone(),
            is_sharing: true,
        });
        let _ = control_tx.send(ControlInput::ScreenStarted);
        Ok(())
    }

    /// Stop sharing. Idempotent. Capture ended from outside (OS controls)
    /// goes through the same path and emits the same event.
    pub async fn stop_screen_share(&self) {
        let epoch = {
            let inner = self.core.lock();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.epoch
        };
        self.core.end_screen_share(epoch, None).await;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn local_id(&self) -> &ParticipantId {
        &self.core.local_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.lock().state
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.core.lock().channel_id.clone()
    }

    /// Local member first, then remote members in join order.
    pub fn participants(&self) -> Vec<ParticipantView> {
        self.core.lock().roster.views().to_vec()
    }

    pub fn is_muted(&self) -> bool {
        self.core.lock().local_mute
    }

    pub fn is_deafened(&self) -> bool {
        self.core.lock().local_deafen
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.core.lock().screen_track.is_some()
    }

    fn pool(&self) -> Option<PeerConnectionPool> {
        self.core.lock().pool.clone()
    }

    pub fn health(&self) -> PoolHealth {
        self.pool().map(|p| p.health()).unwrap_or_default()
    }

    pub fn link(&self, participant: &ParticipantId, kind: LinkKind) -> Option<PeerLinkSnapshot> {
        self.pool()?.link(&LinkKey::new(participant.clone(), kind))
    }

    pub fn links(&self) -> Vec<PeerLinkSnapshot> {
        self.pool().map(|p| p.links()).unwrap_or_default()
    }

    pub fn remote_stream(&self, participant: &ParticipantId, kind: LinkKind) -> Option<RemoteStream> {
        self.pool()?.remote_stream(&LinkKey::new(participant.clone(), kind))
    }
}

fn view_from_summary(summary: &ParticipantSummary) -> ParticipantView {
    ParticipantView {
        is_muted: summary.is_muted,
        is_deafened: summary.is_deafened,
        is_sharing_screen: summary.is_sharing_screen,
        ..ParticipantView::new(summary.user_id.clone(), summary.display_name.clone())
    }
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_gate(&self) -> RwLockWriteGuard<'_, u64> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit only while `epoch` is the live session. The gate stays held
    /// for the duration of the listener call so `leave` cannot return
    /// while an emission of the old epoch is in flight.
    fn emit_gated(&self, epoch: u64, event: VoiceEvent) {
        let gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if *gate == epoch {
            self.emitter.emit(event);
        }
    }

    fn with_connected<R>(&self, epoch: u64, f: impl FnOnce(&mut SessionInner) -> Option<R>) -> Option<R> {
        let mut inner = self.lock();
        if !inner.is_connected(epoch) {
            return None;
        }
        f(&mut inner)
    }

    fn knows(&self, epoch: u64, participant: &ParticipantId) -> bool {
        participant != &self.local_id
            && self
                .with_connected(epoch, |inner| inner.roster.contains(participant).then_some(()))
                .is_some()
    }

    fn is_sharing(&self, epoch: u64) -> bool {
        self.with_connected(epoch, |inner| inner.screen_track.is_some().then_some(()))
            .is_some()
    }

    /// Whether `participant` is currently announced as sharing their screen.
    fn is_remote_sharing(&self, epoch: u64, participant: &ParticipantId) -> bool {
        self.with_connected(epoch, |inner| {
            inner
                .roster
                .get(participant)
                .filter(|v| !v.is_local && v.is_sharing_screen)
                .map(|_| ())
        })
        .is_some()
    }

    /// Update a remote member's view. False if the member is unknown.
    fn update_remote(&self, epoch: u64, participant: &ParticipantId, f: impl FnOnce(&mut ParticipantView)) -> bool {
        self.with_connected(epoch, |inner| {
            let view = inner.roster.get_mut(participant).filter(|v| !v.is_local)?;
            f(view);
            Some(())
        })
        .is_some()
    }

    async fn send(&self, message: RelayMessage) {
        if let Err(e) = self.relay.send(message).await {
            warn!("relay send failed: {e}");
        }
    }

    fn spawn_vad(&self, track: LocalTrack, control_tx: mpsc::UnboundedSender<ControlInput>) -> JoinHandle<()> {
        let detector = VoiceActivityDetector::new(self.config.vad);
        tokio::spawn(detector.run(track, move |speaking| {
            let _ = control_tx.send(ControlInput::LocalSpeaking(speaking));
        }))
    }

    /// Stop a track obtained by a join that lost its race, unless a newer
    /// session already runs on it.
    fn discard_if_idle(&self, track: &LocalTrack) {
        let idle = self.lock().channel_id.is_none();
        if idle {
            debug!(track = track.id(), "discarding track of cancelled join");
            self.media.discard(track);
        }
    }

    /// Reset to `Disconnected` and release everything. UI state goes first,
    /// then tasks, links and media. Returns the channel left, or `None` if
    /// there was nothing to tear down (or `epoch` is no longer live).
    fn teardown(&self, epoch: Option<u64>, reason: Teardown) -> Option<ChannelId> {
        let (channel_id, had_roster, pool, tasks) = {
            let mut gate = self.write_gate();
            let mut inner = self.lock();
            if epoch.is_some_and(|e| e != inner.epoch) {
                return None;
            }
            let channel_id = inner.channel_id.take()?;
            inner.epoch += 1;
            *gate = 0;
            inner.state = ConnectionState::Disconnected;
            inner.local_mute = false;
            inner.local_deafen = false;
            inner.screen_track = None;
            inner.control_tx = None;
            let had_roster = !inner.roster.is_empty();
            inner.roster.clear();
            (channel_id, had_roster, inner.pool.take(), std::mem::take(&mut inner.tasks))
        };

        self.emitter
            .emit(VoiceEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        if had_roster {
            self.emitter.emit(VoiceEvent::ParticipantListChanged(Vec::new()));
        }
        match &reason {
            Teardown::RelayLost => self.emitter.emit(VoiceEvent::Error(ErrorReason::RelayDisconnected)),
            Teardown::JoinFailed(Some(reason)) => self.emitter.emit(VoiceEvent::Error(reason.clone())),
            Teardown::Leave | Teardown::JoinFailed(None) => {}
        }

        // The loop tears down from inside itself on relay loss.
        if let Some(handle) = tasks.event_loop
            && reason != Teardown::RelayLost
        {
            handle.abort();
        }
        for handle in [tasks.vad, tasks.screen_watch].into_iter().flatten() {
            handle.abort();
        }
        if let Some(pool) = pool {
            pool.close_all();
        }
        self.media.release_all();
        debug!(channel = %channel_id, ?reason, "session torn down");
        Some(channel_id)
    }

    /// End the local screen share of `epoch`. `track_id` names the capture
    /// that ended; a stale id (an earlier share) is ignored.
    async fn end_screen_share(&self, epoch: u64, track_id: Option<String>) -> bool {
        let ended = self.with_connected(epoch, |inner| {
            let current = inner.screen_track.as_ref()?;
            if track_id.as_ref().is_some_and(|id| id != current) {
                return None;
            }
            inner.screen_track = None;
            if let Some(local) = inner.roster.local_mut() {
                local.is_sharing_screen = false;
            }
            if let Some(pool) = &inner.pool {
                pool.set_local_screen(None);
                pool.remove_links_of_kind(LinkKind::OutboundScreen);
            }
            if let Some(watcher) = inner.tasks.screen_watch.take() {
                watcher.abort();
            }
            inner.channel_id.clone()
        });
        let Some(channel_id) = ended else {
            return false;
        };

        self.media.stop_screen_share();
        info!("screen share stopped");
        self.send(RelayMessage::ScreenShareStopped { channel_id }).await;
        self.emit_gated(epoch, VoiceEvent::ScreenShareChanged {
            user_id: self.local_id.clone(),
            is_sharing: false,
        });
        true
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Serializes relay events, connection events and local control inputs
/// for one session epoch. Holds the session weakly.
struct EventLoop {
    core: Weak<SessionCore>,
    epoch: u64,
    channel_id: ChannelId,
    pool: PeerConnectionPool,
}

impl EventLoop {
    async fn run(
        self,
        mut control_rx: mpsc::UnboundedReceiver<ControlInput>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerInput>,
        mut relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        loop {
            let flow = tokio::select! {
                biased;
                Some(input) = control_rx.recv() => self.on_control(input).await,
                Some(input) = peer_rx.recv() => self.on_peer(input).await,
                event = relay_rx.recv() => self.on_relay(event).await,
            };
            if flow.is_break() {
                break;
            }
        }
        debug!(channel = %self.channel_id, "session event loop stopped");
    }

    fn core(&self) -> Option<Arc<SessionCore>> {
        self.core.upgrade()
    }

    fn surface(&self, core: &SessionCore, notice: Option<PoolNotice>) {
        match notice {
            Some(PoolNotice::StreamReady { key, stream }) => core.emit_gated(
                self.epoch,
                VoiceEvent::RemoteStreamAvailable {
                    user_id: key.participant,
                    kind: key.kind,
                    stream,
                },
            ),
            Some(PoolNotice::LinkFailed { key, .. }) => core.emit_gated(
                self.epoch,
                VoiceEvent::Error(ErrorReason::NegotiationFailed {
                    user_id: key.participant,
                    kind: key.kind,
                }),
            ),
            None => {}
        }
    }

    async fn open(&self, core: &SessionCore, participant: ParticipantId, kind: LinkKind, role: Role) {
        let notice = self.pool.open_link(participant, kind, role).await;
        self.surface(core, notice);
    }

    async fn on_control(&self, input: ControlInput) -> ControlFlow<()> {
        let Some(core) = self.core() else {
            return ControlFlow::Break(());
        };
        match input {
            ControlInput::LocalSpeaking(speaking) => {
                let changed = core.with_connected(self.epoch, |inner| {
                    let local = inner.roster.local_mut()?;
                    if local.is_speaking == speaking {
                        return None;
                    }
                    local.is_speaking = speaking;
                    Some(())
                });
                if changed.is_some() {
                    core.emit_gated(self.epoch, VoiceEvent::SpeakingChanged {
                        user_id: core.local_id.clone(),
                        is_speaking: speaking,
                    });
                    core.send(RelayMessage::Speaking { is_speaking: speaking }).await;
                }
            }
            ControlInput::Bootstrap(snapshot) => {
                for member in snapshot {
                    if !core.knows(self.epoch, &member.user_id) {
                        continue;
                    }
                    self.open(&core, member.user_id.clone(), LinkKind::Audio, Role::Responder).await;
                    if member.is_sharing_screen {
                        self.open(&core, member.user_id, LinkKind::InboundScreen, Role::Responder).await;
                    }
                }
            }
            ControlInput::ScreenStarted => {
                let remotes = core
                    .with_connected(self.epoch, |inner| {
                        inner.screen_track.is_some().then(|| inner.roster.remote_ids())
                    })
                    .unwrap_or_default();
                for participant in remotes {
                    if !core.is_sharing(self.epoch) {
                        debug!("screen share ended during fan-out");
                        break;
                    }
                    self.open(&core, participant, LinkKind::OutboundScreen, Role::Initiator).await;
                }
            }
            ControlInput::ScreenEnded { track_id } => {
                core.end_screen_share(self.epoch, Some(track_id)).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_peer(&self, input: PeerInput) -> ControlFlow<()> {
        let Some(core) = self.core() else {
            return ControlFlow::Break(());
        };
        let notice = self.pool.handle_peer_event(input).await;
        self.surface(&core, notice);
        ControlFlow::Continue(())
    }

    async fn on_relay(&self, event: Option<RelayEvent>) -> ControlFlow<()> {
        let Some(core) = self.core() else {
            return ControlFlow::Break(());
        };
        let Some(event) = event else {
            return self.relay_lost(&core);
        };

        match event {
            RelayEvent::Disconnected => return self.relay_lost(&core),
            RelayEvent::UserJoined { user_id, channel_id, display_name } => {
                if channel_id != self.channel_id || user_id == core.local_id {
                    return ControlFlow::Continue(());
                }
                let joined = core.with_connected(self.epoch, |inner| {
                    if !inner.roster.add(ParticipantView::new(user_id.clone(), display_name)) {
                        return None;
                    }
                    Some(inner.roster.views().to_vec())
                });
                let Some(views) = joined else {
                    debug!(participant = %user_id, "duplicate presence ignored");
                    return ControlFlow::Continue(());
                };
                info!(participant = %user_id, "participant joined");
                core.emit_gated(self.epoch, VoiceEvent::ParticipantListChanged(views));
                self.open(&core, user_id.clone(), LinkKind::Audio, Role::Initiator).await;
                if core.is_sharing(self.epoch) {
                    self.open(&core, user_id, LinkKind::OutboundScreen, Role::Initiator).await;
                }
            }
            RelayEvent::UserLeft { user_id, channel_id } => {
                if channel_id != self.channel_id || user_id == core.local_id {
                    return ControlFlow::Continue(());
                }
                let left = core.with_connected(self.epoch, |inner| {
                    inner.roster.remove(&user_id).filter(|v| !v.is_local)?;
                    self.pool.remove_participant(&user_id);
                    Some(inner.roster.views().to_vec())
                });
                match left {
                    Some(views) => {
                        info!(participant = %user_id, "participant left");
                        core.emit_gated(self.epoch, VoiceEvent::ParticipantListChanged(views));
                    }
                    None => debug!(participant = %user_id, "departure of unknown participant ignored"),
                }
            }
            RelayEvent::Signal { from, channel_id, signal } => {
                if channel_id != self.channel_id {
                    return ControlFlow::Continue(());
                }
                if !core.knows(self.epoch, &from) {
                    warn!(participant = %from, kind = signal.kind(), "signal from unknown participant dropped");
                    return ControlFlow::Continue(());
                }
                let notice = self.pool.handle_signal(LinkKey::new(from, LinkKind::Audio), signal).await;
                self.surface(&core, notice);
            }
            RelayEvent::ScreenSignal { from, channel_id, sharer, signal } => {
                if channel_id != self.channel_id {
                    return ControlFlow::Continue(());
                }
                let kind = if sharer == core.local_id {
                    LinkKind::OutboundScreen
                } else if sharer == from {
                    LinkKind::InboundScreen
                } else {
                    warn!(participant = %from, sharer = %sharer, "screen signal for a third party dropped");
                    return ControlFlow::Continue(());
                };
                if !core.knows(self.epoch, &from) {
                    warn!(participant = %from, kind = signal.kind(), "screen signal from unknown participant dropped");
                    return ControlFlow::Continue(());
                }
                let live = match kind {
                    LinkKind::InboundScreen => core.is_remote_sharing(self.epoch, &from),
                    _ => core.is_sharing(self.epoch),
                };
                if !live {
                    debug!(participant = %from, kind = signal.kind(), "screen signal for an ended share dropped");
                    return ControlFlow::Continue(());
                }
                let notice = self.pool.handle_signal(LinkKey::new(from, kind), signal).await;
                self.surface(&core, notice);
            }
            RelayEvent::UserMuted { user_id, is_muted } => {
                if core.update_remote(self.epoch, &user_id, |v| v.is_muted = is_muted) {
                    core.emit_gated(self.epoch, VoiceEvent::MuteChanged { user_id, is_muted });
                }
            }
            RelayEvent::UserDeafened { user_id, is_deafened } => {
                if core.update_remote(self.epoch, &user_id, |v| v.is_deafened = is_deafened) {
                    core.emit_gated(self.epoch, VoiceEvent::DeafenChanged { user_id, is_deafened });
                }
            }
            RelayEvent::UserSpeaking { user_id, is_speaking } => {
                if core.update_remote(self.epoch, &user_id, |v| v.is_speaking = is_speaking) {
                    core.emit_gated(self.epoch, VoiceEvent::SpeakingChanged { user_id, is_speaking });
                }
            }
            RelayEvent::ScreenShareStarted { user_id, channel_id } => {
                if channel_id != self.channel_id
                    || !core.update_remote(self.epoch, &user_id, |v| v.is_sharing_screen = true)
                {
                    return ControlFlow::Continue(());
                }
                core.emit_gated(self.epoch, VoiceEvent::ScreenShareChanged {
                    user_id: user_id.clone(),
                    is_sharing: true,
                });
                self.open(&core, user_id, LinkKind::InboundScreen, Role::Responder).await;
            }
            RelayEvent::ScreenShareStopped { user_id, channel_id } => {
                if channel_id != self.channel_id
                    || !core.update_remote(self.epoch, &user_id, |v| v.is_sharing_screen = false)
                {
                    return ControlFlow::Continue(());
                }
                self.pool.remove_link(&LinkKey::new(user_id.clone(), LinkKind::InboundScreen));
                core.emit_gated(self.epoch, VoiceEvent::ScreenShareChanged {
                    user_id,
                    is_sharing: false,
                });
            }
        }
        ControlFlow::Continue(())
    }

    fn relay_lost(&self, core: &SessionCore) -> ControlFlow<()> {
        warn!(channel = %self.channel_id, "signaling relay lost");
        core.teardown(Some(self.epoch), Teardown::RelayLost);
        ControlFlow::Break(())
    }
}
