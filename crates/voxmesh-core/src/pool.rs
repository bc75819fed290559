//! Peer link ownership and negotiation.
//!
//! The pool is the only owner of peer links. Everything else refers to a
//! link by `LinkKey`, and connection events come back tagged with the
//! generation of the connection that produced them, so events from a
//! replaced or removed connection are dropped on arrival.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::NegotiationError;
use crate::media::LocalTrack;
use crate::participants::{ChannelId, ParticipantId};
use crate::signaling::{IceCandidate, RelayMessage, SignalPayload, SignalingRelay};
use crate::transport::{
    ConnectRequest, LinkKey, LinkKind, PeerConnection, PeerConnector, PeerEvent, PeerEventSink,
    PeerInput, RemoteStream, Role,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerSent,
    Stable,
    Failed,
    Closed,
}

impl NegotiationState {
    fn is_negotiating(self) -> bool {
        matches!(self, Self::New | Self::OfferSent | Self::AnswerSent)
    }
}

/// Retry allowance of a link: one retry, then the link is failed for the
/// rest of the participant's tenure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Fresh,
    Spent,
}

/// Aggregate link counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolHealth {
    pub stable: usize,
    pub negotiating: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkSnapshot {
    pub key: LinkKey,
    pub role: Role,
    pub state: NegotiationState,
    pub has_remote_stream: bool,
    pub retry: RetryBudget,
}

/// Outcome of pool work that the session has to surface.
#[derive(Debug, Clone)]
pub enum PoolNotice {
    StreamReady { key: LinkKey, stream: RemoteStream },
    LinkFailed { key: LinkKey, reason: NegotiationError },
}

struct PeerLink {
    generation: Uuid,
    role: Role,
    state: NegotiationState,
    retry: RetryBudget,
    connection: Option<Arc<dyn PeerConnection>>,
    /// Remote description applied; candidates can go straight through.
    remote_applied: bool,
    remote_stream: Option<RemoteStream>,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerLink {
    fn new(role: Role) -> Self {
        Self {
            generation: Uuid::new_v4(),
            role,
            state: NegotiationState::New,
            retry: RetryBudget::Fresh,
            connection: None,
            remote_applied: false,
            remote_stream: None,
            pending_candidates: Vec::new(),
        }
    }

    /// Replace the connection with a fresh generation. Keeps the retry budget.
    fn reset(&mut self, role: Role) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.generation = Uuid::new_v4();
        self.role = role;
        self.state = NegotiationState::New;
        self.remote_applied = false;
        self.remote_stream = None;
        self.pending_candidates.clear();
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.state = NegotiationState::Closed;
    }

    fn is_current(&self, generation: Uuid) -> bool {
        self.generation == generation
            && !matches!(self.state, NegotiationState::Failed | NegotiationState::Closed)
    }

    fn snapshot(&self, key: &LinkKey) -> PeerLinkSnapshot {
        PeerLinkSnapshot {
            key: key.clone(),
            role: self.role,
            state: self.state,
            has_remote_stream: self.remote_stream.is_some(),
            retry: self.retry,
        }
    }
}

struct LinkFailure {
    generation: Uuid,
    reason: NegotiationError,
}

enum FailOutcome {
    Ignored,
    Retry,
    Terminal(PoolNotice),
}

enum OfferPlan {
    Ignore,
    Open,
    Existing(Uuid, Arc<dyn PeerConnection>),
}

#[derive(Default)]
struct PoolState {
    links: HashMap<LinkKey, PeerLink>,
    inbound_audio_enabled: bool,
    closed: bool,
    local_audio: Option<LocalTrack>,
    local_screen: Option<LocalTrack>,
}

struct PoolShared {
    local_id: ParticipantId,
    channel_id: ChannelId,
    connector: Arc<dyn PeerConnector>,
    relay: Arc<dyn SignalingRelay>,
    peer_tx: mpsc::UnboundedSender<PeerInput>,
    state: Mutex<PoolState>,
}

/// Owns every peer link of one channel session.
///
/// Async operations are driven from the session's event loop one at a
/// time; after every suspension point the link is looked up again and its
/// generation compared, so a link removed mid-negotiation is never revived.
#[derive(Clone)]
pub struct PeerConnectionPool {
    shared: Arc<PoolShared>,
}

impl PeerConnectionPool {
    pub fn new(
        local_id: ParticipantId,
        channel_id: ChannelId,
        connector: Arc<dyn PeerConnector>,
        relay: Arc<dyn SignalingRelay>,
        local_audio: Option<LocalTrack>,
        peer_tx: mpsc::UnboundedSender<PeerInput>,
    ) -> Self {
        let state = PoolState {
            inbound_audio_enabled: true,
            local_audio,
            ..PoolState::default()
        };
        Self {
            shared: Arc::new(PoolShared {
                local_id,
                channel_id,
                connector,
                relay,
                peer_tx,
                state: Mutex::new(state),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Link lifecycle
    // -----------------------------------------------------------------------

    /// Create a link and start negotiating it. Initiators send an offer;
    /// responders open a connection and wait for one. No-op if the link
    /// already exists, including a link failed for this tenure.
    pub async fn open_link(&self, participant: ParticipantId, kind: LinkKind, role: Role) -> Option<PoolNotice> {
        let key = LinkKey::new(participant, kind);
        {
            let mut state = self.state();
            if state.closed || state.links.contains_key(&key) {
                return None;
            }
            if kind == LinkKind::OutboundScreen && state.local_screen.is_none() {
                tracing::debug!(participant = %key.participant, "no screen track, outbound screen link not opened");
                return None;
            }
            state.links.insert(key.clone(), PeerLink::new(role));
        }
        tracing::debug!(participant = %key.participant, ?kind, ?role, "peer link created");
        self.establish(&key).await
    }

    /// Remove every link to a participant. The only removal path on departure.
    pub fn remove_participant(&self, participant: &ParticipantId) -> usize {
        let mut state = self.state();
        let mut removed = 0;
        for kind in [LinkKind::Audio, LinkKind::OutboundScreen, LinkKind::InboundScreen] {
            if let Some(mut link) = state.links.remove(&LinkKey::new(participant.clone(), kind)) {
                link.close();
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(%participant, removed, "peer links removed");
        }
        removed
    }

    pub fn remove_link(&self, key: &LinkKey) -> bool {
        match self.state().links.remove(key) {
            Some(mut link) => {
                link.close();
                tracing::debug!(participant = %key.participant, kind = ?key.kind, "peer link removed");
                true
            }
            None => false,
        }
    }

    /// Remove every link of one kind. Returns the participants they pointed at.
    pub fn remove_links_of_kind(&self, kind: LinkKind) -> Vec<ParticipantId> {
        let mut state = self.state();
        let keys: Vec<LinkKey> = state.links.keys().filter(|k| k.kind == kind).cloned().collect();
        keys.into_iter()
            .filter_map(|key| {
                let mut link = state.links.remove(&key)?;
                link.close();
                Some(key.participant)
            })
            .collect()
    }

    /// Close every link and refuse new ones.
    pub fn close_all(&self) {
        let mut state = self.state();
        state.closed = true;
        let count = state.links.len();
        for (_, mut link) in state.links.drain() {
            link.close();
        }
        state.local_audio = None;
        state.local_screen = None;
        tracing::debug!(count, "peer pool closed");
    }

    /// Track attached to outbound screen links created from now on.
    pub fn set_local_screen(&self, track: Option<LocalTrack>) {
        self.state().local_screen = track;
    }

    /// Silence or restore inbound audio on every audio link without
    /// renegotiating. Applies to links that connect later as well.
    pub fn set_inbound_audio_enabled(&self, enabled: bool) {
        let mut state = self.state();
        state.inbound_audio_enabled = enabled;
        for (key, link) in &state.links {
            if key.kind == LinkKind::Audio
                && let Some(stream) = &link.remote_stream
            {
                stream.set_audio_enabled(enabled);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn health(&self) -> PoolHealth {
        let state = self.state();
        let mut health = PoolHealth::default();
        for link in state.links.values() {
            match link.state {
                NegotiationState::Stable => health.stable += 1,
                NegotiationState::Failed => health.failed += 1,
                s if s.is_negotiating() => health.negotiating += 1,
                _ => {}
            }
        }
        health
    }

    pub fn link(&self, key: &LinkKey) -> Option<PeerLinkSnapshot> {
        self.state().links.get(key).map(|link| link.snapshot(key))
    }

    /// Every link, ordered by participant then kind.
    pub fn links(&self) -> Vec<PeerLinkSnapshot> {
        let state = self.state();
        let mut links: Vec<_> = state.links.iter().map(|(key, link)| link.snapshot(key)).collect();
        links.sort_by(|a, b| a.key.cmp(&b.key));
        links
    }

    pub fn remote_stream(&self, key: &LinkKey) -> Option<RemoteStream> {
        self.state().links.get(key)?.remote_stream.clone()
    }

    // -----------------------------------------------------------------------
    // Inbound signals and connection events
    // -----------------------------------------------------------------------

    /// Apply a signal from the remote end of `key`.
    pub async fn handle_signal(&self, key: LinkKey, signal: SignalPayload) -> Option<PoolNotice> {
        match signal {
            SignalPayload::Offer { sdp } => self.handle_offer(&key, &sdp).await,
            SignalPayload::Answer { sdp } => self.handle_answer(&key, &sdp).await,
            SignalPayload::Candidate { candidate } => {
                self.handle_candidate(&key, candidate).await;
                None
            }
        }
    }

    /// Apply an event reported by a connection.
    pub async fn handle_peer_event(&self, input: PeerInput) -> Option<PoolNotice> {
        let PeerInput { key, generation, event } = input;
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.is_current(&key, generation) {
                    self.send_signal(&key, SignalPayload::Candidate { candidate }).await;
                }
                None
            }
            PeerEvent::Connected(stream) => {
                let mut state = self.state();
                let inbound_audio = state.inbound_audio_enabled;
                let link = state.links.get_mut(&key).filter(|l| l.is_current(generation))?;
                if key.kind == LinkKind::Audio {
                    stream.set_audio_enabled(inbound_audio);
                }
                link.state = NegotiationState::Stable;
                link.remote_stream = Some(stream.clone());
                tracing::info!(participant = %key.participant, kind = ?key.kind, "peer link stable");
                Some(PoolNotice::StreamReady { key, stream })
            }
            PeerEvent::Failed(reason) => {
                let failure = LinkFailure {
                    generation,
                    reason: NegotiationError::new(reason),
                };
                self.recover(&key, failure).await
            }
        }
    }

    async fn handle_offer(&self, key: &LinkKey, sdp: &str) -> Option<PoolNotice> {
        let (generation, connection) = match self.plan_offer(key) {
            OfferPlan::Ignore => return None,
            OfferPlan::Existing(generation, connection) => (generation, connection),
            OfferPlan::Open => {
                if let Err(failure) = self.connect(key).await {
                    return self.recover(key, failure).await;
                }
                let state = self.state();
                let link = state.links.get(key)?;
                (link.generation, link.connection.clone()?)
            }
        };

        match self.answer(key, generation, &connection, sdp).await {
            Ok(()) => None,
            Err(failure) => self.recover(key, failure).await,
        }
    }

    fn plan_offer(&self, key: &LinkKey) -> OfferPlan {
        let local_id = self.shared.local_id.clone();
        let mut state = self.state();
        if state.closed {
            return OfferPlan::Ignore;
        }
        let link = state.links.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(participant = %key.participant, kind = ?key.kind, "offer opens responder link");
            PeerLink::new(Role::Responder)
        });

        match (link.role, link.state) {
            (_, NegotiationState::Failed) => {
                tracing::debug!(participant = %key.participant, "offer on failed link ignored");
                OfferPlan::Ignore
            }
            (Role::Initiator, _) => {
                // Both ends offered. The lower id yields and answers.
                if local_id < key.participant {
                    tracing::info!(participant = %key.participant, kind = ?key.kind, "offer collision, yielding");
                    link.reset(Role::Responder);
                    OfferPlan::Open
                } else {
                    tracing::debug!(participant = %key.participant, kind = ?key.kind, "offer collision, keeping initiator role");
                    OfferPlan::Ignore
                }
            }
            (Role::Responder, NegotiationState::New) if !link.remote_applied => match &link.connection {
                Some(connection) => OfferPlan::Existing(link.generation, connection.clone()),
                None => OfferPlan::Open,
            },
            (Role::Responder, _) => {
                tracing::debug!(participant = %key.participant, kind = ?key.kind, "re-offer resets link");
                link.reset(Role::Responder);
                OfferPlan::Open
            }
        }
    }

    async fn answer(
        &self,
        key: &LinkKey,
        generation: Uuid,
        connection: &Arc<dyn PeerConnection>,
        sdp: &str,
    ) -> Result<(), LinkFailure> {
        let answer = connection
            .accept_offer(sdp)
            .await
            .map_err(|reason| LinkFailure { generation, reason })?;

        let pending = {
            let mut state = self.state();
            let Some(link) = state.links.get_mut(key).filter(|l| l.is_current(generation)) else {
                return Ok(());
            };
            link.remote_applied = true;
            link.state = NegotiationState::AnswerSent;
            std::mem::take(&mut link.pending_candidates)
        };

        tracing::debug!(participant = %key.participant, kind = ?key.kind, "answer sent");
        self.send_signal(key, SignalPayload::Answer { sdp: answer }).await;
        self.apply_candidates(key, connection, pending).await;
        Ok(())
    }

    async fn handle_answer(&self, key: &LinkKey, sdp: &str) -> Option<PoolNotice> {
        let (generation, connection) = {
            let state = self.state();
            let link = state.links.get(key);
            match link {
                Some(link) if link.role == Role::Initiator && link.state == NegotiationState::OfferSent => {
                    (link.generation, link.connection.clone()?)
                }
                _ => {
                    tracing::debug!(participant = %key.participant, kind = ?key.kind, "unexpected answer ignored");
                    return None;
                }
            }
        };

        if let Err(reason) = connection.accept_answer(sdp).await {
            return self.recover(key, LinkFailure { generation, reason }).await;
        }

        let pending = {
            let mut state = self.state();
            let link = state.links.get_mut(key).filter(|l| l.is_current(generation))?;
            link.remote_applied = true;
            std::mem::take(&mut link.pending_candidates)
        };
        tracing::debug!(participant = %key.participant, kind = ?key.kind, "answer applied");
        self.apply_candidates(key, &connection, pending).await;
        None
    }

    async fn handle_candidate(&self, key: &LinkKey, candidate: IceCandidate) {
        let connection = {
            let mut state = self.state();
            let Some(link) = state.links.get_mut(key) else {
                tracing::debug!(participant = %key.participant, kind = ?key.kind, "candidate for unknown link dropped");
                return;
            };
            match (&link.connection, link.state) {
                (_, NegotiationState::Failed | NegotiationState::Closed) => return,
                (Some(connection), _) if link.remote_applied => connection.clone(),
                _ => {
                    link.pending_candidates.push(candidate);
                    return;
                }
            }
        };
        if let Err(e) = connection.add_ice_candidate(&candidate).await {
            tracing::warn!(participant = %key.participant, "ice candidate rejected: {e}");
        }
    }

    async fn apply_candidates(&self, key: &LinkKey, connection: &Arc<dyn PeerConnection>, pending: Vec<IceCandidate>) {
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(&candidate).await {
                tracing::warn!(participant = %key.participant, "buffered ice candidate rejected: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Negotiation steps
    // -----------------------------------------------------------------------

    /// Connect the link's current generation, retrying once on failure.
    async fn establish(&self, key: &LinkKey) -> Option<PoolNotice> {
        loop {
            let Err(failure) = self.connect(key).await else {
                return None;
            };
            match self.fail(key, failure) {
                FailOutcome::Retry => continue,
                FailOutcome::Ignored => return None,
                FailOutcome::Terminal(notice) => return Some(notice),
            }
        }
    }

    async fn recover(&self, key: &LinkKey, failure: LinkFailure) -> Option<PoolNotice> {
        match self.fail(key, failure) {
            FailOutcome::Retry => self.establish(key).await,
            FailOutcome::Ignored => None,
            FailOutcome::Terminal(notice) => Some(notice),
        }
    }

    async fn connect(&self, key: &LinkKey) -> Result<(), LinkFailure> {
        let (generation, role, request) = {
            let state = self.state();
            let Some(link) = state.links.get(key).filter(|l| l.state == NegotiationState::New) else {
                return Ok(());
            };
            let outbound = match key.kind {
                LinkKind::Audio => state.local_audio.clone(),
                LinkKind::OutboundScreen => state.local_screen.clone(),
                LinkKind::InboundScreen => None,
            };
            let request = ConnectRequest {
                remote: key.participant.clone(),
                kind: key.kind,
                role: link.role,
                outbound,
            };
            (link.generation, link.role, request)
        };

        let sink = PeerEventSink::new(key.clone(), generation, self.shared.peer_tx.clone());
        let connection = self
            .shared
            .connector
            .open(request, sink)
            .await
            .map_err(|reason| LinkFailure { generation, reason })?;

        {
            let mut state = self.state();
            let sharing = key.kind != LinkKind::OutboundScreen || state.local_screen.is_some();
            let Some(link) = state.links.get_mut(key).filter(|l| l.is_current(generation)) else {
                connection.close();
                return Ok(());
            };
            if sharing {
                link.connection = Some(connection.clone());
            } else {
                // The share ended while the connection was opening.
                link.close();
                state.links.remove(key);
                connection.close();
                tracing::debug!(participant = %key.participant, "screen share ended, outbound screen link dropped");
                return Ok(());
            }
        }

        if role == Role::Initiator {
            self.offer(key, generation, &connection).await?;
        }
        Ok(())
    }

    async fn offer(&self, key: &LinkKey, generation: Uuid, connection: &Arc<dyn PeerConnection>) -> Result<(), LinkFailure> {
        let sdp = connection
            .create_offer()
            .await
            .map_err(|reason| LinkFailure { generation, reason })?;
        {
            let mut state = self.state();
            let Some(link) = state.links.get_mut(key).filter(|l| l.is_current(generation)) else {
                return Ok(());
            };
            link.state = NegotiationState::OfferSent;
        }
        tracing::debug!(participant = %key.participant, kind = ?key.kind, "offer sent");
        self.send_signal(key, SignalPayload::Offer { sdp }).await;
        Ok(())
    }

    fn fail(&self, key: &LinkKey, failure: LinkFailure) -> FailOutcome {
        let mut state = self.state();
        let Some(link) = state.links.get_mut(key) else {
            return FailOutcome::Ignored;
        };
        if !link.is_current(failure.generation) {
            return FailOutcome::Ignored;
        }
        match link.retry {
            RetryBudget::Fresh => {
                tracing::warn!(participant = %key.participant, kind = ?key.kind, "peer link failed, retrying: {}", failure.reason);
                link.retry = RetryBudget::Spent;
                let role = link.role;
                link.reset(role);
                FailOutcome::Retry
            }
            RetryBudget::Spent => {
                tracing::error!(participant = %key.participant, kind = ?key.kind, "peer link failed: {}", failure.reason);
                if let Some(connection) = link.connection.take() {
                    connection.close();
                }
                link.state = NegotiationState::Failed;
                link.remote_stream = None;
                link.pending_candidates.clear();
                FailOutcome::Terminal(PoolNotice::LinkFailed {
                    key: key.clone(),
                    reason: failure.reason,
                })
            }
        }
    }

    fn is_current(&self, key: &LinkKey, generation: Uuid) -> bool {
        self.state().links.get(key).is_some_and(|l| l.is_current(generation))
    }

    async fn send_signal(&self, key: &LinkKey, signal: SignalPayload) {
        let channel_id = self.shared.channel_id.clone();
        let to = key.participant.clone();
        let message = match key.kind {
            LinkKind::Audio => RelayMessage::Signal { to, channel_id, signal },
            LinkKind::OutboundScreen => RelayMessage::ScreenSignal {
                to,
                channel_id,
                sharer: self.shared.local_id.clone(),
                signal,
            },
            LinkKind::InboundScreen => RelayMessage::ScreenSignal {
                sharer: to.clone(),
                to,
                channel_id,
                signal,
            },
        };
        if let Err(e) = self.shared.relay.send(message).await {
            tracing::warn!(participant = %key.participant, "signal not relayed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VoiceError;
    use crate::signaling::{ParticipantSummary, RelayRegistration};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<RelayMessage>>,
    }

    impl RecordingRelay {
        fn take(&self) -> Vec<RelayMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl SignalingRelay for RecordingRelay {
        async fn register(&self, _: &ChannelId, _: &ParticipantSummary) -> Result<RelayRegistration, VoiceError> {
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(RelayRegistration { participants: Vec::new(), events })
        }

        async fn unregister(&self, _: &ChannelId) -> Result<(), VoiceError> {
            Ok(())
        }

        async fn send(&self, message: RelayMessage) -> Result<(), VoiceError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubConnection {
        candidates: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl PeerConnection for StubConnection {
        async fn create_offer(&self) -> Result<String, NegotiationError> {
            Ok("v=0 offer".into())
        }

        async fn accept_offer(&self, _sdp: &str) -> Result<String, NegotiationError> {
            Ok("v=0 answer".into())
        }

        async fn accept_answer(&self, _sdp: &str) -> Result<(), NegotiationError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), NegotiationError> {
            self.candidates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StubConnector {
        opened: Mutex<Vec<(ConnectRequest, PeerEventSink, Arc<StubConnection>)>>,
    }

    impl StubConnector {
        fn last(&self) -> (PeerEventSink, Arc<StubConnection>) {
            let opened = self.opened.lock().unwrap();
            let (_, sink, conn) = opened.last().unwrap();
            (sink.clone(), conn.clone())
        }

        fn count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PeerConnector for StubConnector {
        async fn open(&self, request: ConnectRequest, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
            let connection = Arc::new(StubConnection::default());
            self.opened
                .lock()
                .unwrap()
                .push((request, events, connection.clone()));
            Ok(connection)
        }
    }

    struct Fixture {
        pool: PeerConnectionPool,
        relay: Arc<RecordingRelay>,
        connector: Arc<StubConnector>,
        peer_rx: mpsc::UnboundedReceiver<PeerInput>,
    }

    fn fixture(local: &str) -> Fixture {
        let relay = Arc::new(RecordingRelay::default());
        let connector = Arc::new(StubConnector::default());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let pool = PeerConnectionPool::new(
            local.into(),
            "c1".into(),
            connector.clone(),
            relay.clone(),
            Some(LocalTrack::new(crate::transport::MediaKind::Audio)),
            peer_tx,
        );
        Fixture { pool, relay, connector, peer_rx }
    }

    fn audio(id: &str) -> LinkKey {
        LinkKey::new(id.into(), LinkKind::Audio)
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    #[tokio::test]
    async fn initiator_sends_offer_with_shared_track() {
        let f = fixture("a");
        assert!(f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await.is_none());

        let sent = f.relay.take();
        assert!(matches!(
            &sent[..],
            [RelayMessage::Signal { to, signal: SignalPayload::Offer { .. }, .. }] if to.as_str() == "b"
        ));
        assert_eq!(f.pool.link(&audio("b")).unwrap().state, NegotiationState::OfferSent);

        let opened = f.connector.opened.lock().unwrap();
        assert!(opened[0].0.outbound.is_some());
    }

    #[tokio::test]
    async fn responder_buffers_candidates_until_offer_applied() {
        let f = fixture("b");
        f.pool.open_link("a".into(), LinkKind::Audio, Role::Responder).await;
        assert!(f.relay.take().is_empty());

        f.pool
            .handle_signal(audio("a"), SignalPayload::Candidate { candidate: candidate() })
            .await;
        let (_, conn) = f.connector.last();
        assert_eq!(conn.candidates.load(Ordering::SeqCst), 0);

        f.pool
            .handle_signal(audio("a"), SignalPayload::Offer { sdp: "v=0".into() })
            .await;
        assert_eq!(conn.candidates.load(Ordering::SeqCst), 1);
        assert_eq!(f.pool.link(&audio("a")).unwrap().state, NegotiationState::AnswerSent);
        assert!(matches!(
            &f.relay.take()[..],
            [RelayMessage::Signal { signal: SignalPayload::Answer { .. }, .. }]
        ));
    }

    #[tokio::test]
    async fn connected_event_makes_link_stable() {
        let f = fixture("a");
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        f.pool
            .handle_signal(audio("b"), SignalPayload::Answer { sdp: "v=0".into() })
            .await;

        let (sink, _) = f.connector.last();
        sink.emit(PeerEvent::Connected(RemoteStream::new("s1")));
        let mut rx = f.peer_rx;
        let input = rx.recv().await.unwrap();
        let notice = f.pool.handle_peer_event(input).await;

        assert!(matches!(notice, Some(PoolNotice::StreamReady { .. })));
        assert_eq!(f.pool.health(), PoolHealth { stable: 1, negotiating: 0, failed: 0 });
    }

    #[tokio::test]
    async fn one_retry_then_terminal_failure() {
        let f = fixture("a");
        let mut rx = f.peer_rx;
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        f.relay.take();

        let (sink, first) = f.connector.last();
        sink.emit(PeerEvent::Failed("ice failed".into()));
        let notice = f.pool.handle_peer_event(rx.recv().await.unwrap()).await;
        assert!(notice.is_none());
        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        assert_eq!(f.connector.count(), 2);
        assert!(matches!(
            &f.relay.take()[..],
            [RelayMessage::Signal { signal: SignalPayload::Offer { .. }, .. }]
        ));
        let link = f.pool.link(&audio("b")).unwrap();
        assert_eq!(link.retry, RetryBudget::Spent);
        assert_eq!(link.state, NegotiationState::OfferSent);

        // A late event from the replaced connection changes nothing.
        sink.emit(PeerEvent::Failed("late".into()));
        assert!(f.pool.handle_peer_event(rx.recv().await.unwrap()).await.is_none());

        let (sink, _) = f.connector.last();
        sink.emit(PeerEvent::Failed("ice failed again".into()));
        let notice = f.pool.handle_peer_event(rx.recv().await.unwrap()).await;
        assert!(matches!(notice, Some(PoolNotice::LinkFailed { .. })));
        assert_eq!(f.pool.health().failed, 1);
        assert_eq!(f.connector.count(), 2);

        // Failed for this tenure: no new link, no re-offer accepted.
        assert!(f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await.is_none());
        assert_eq!(f.connector.count(), 2);
    }

    #[tokio::test]
    async fn lower_id_yields_on_offer_collision() {
        let f = fixture("a");
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        f.relay.take();

        f.pool
            .handle_signal(audio("b"), SignalPayload::Offer { sdp: "v=0".into() })
            .await;
        let link = f.pool.link(&audio("b")).unwrap();
        assert_eq!(link.role, Role::Responder);
        assert_eq!(link.state, NegotiationState::AnswerSent);
        assert_eq!(link.retry, RetryBudget::Fresh);
    }

    #[tokio::test]
    async fn higher_id_keeps_initiator_role_on_offer_collision() {
        let f = fixture("z");
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        f.relay.take();

        f.pool
            .handle_signal(audio("b"), SignalPayload::Offer { sdp: "v=0".into() })
            .await;
        let link = f.pool.link(&audio("b")).unwrap();
        assert_eq!(link.role, Role::Initiator);
        assert_eq!(link.state, NegotiationState::OfferSent);
        assert!(f.relay.take().is_empty());
    }

    #[tokio::test]
    async fn removing_participant_drops_audio_and_screen_links() {
        let f = fixture("a");
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        f.pool.open_link("b".into(), LinkKind::InboundScreen, Role::Responder).await;
        f.pool.open_link("c".into(), LinkKind::Audio, Role::Initiator).await;

        assert_eq!(f.pool.remove_participant(&"b".into()), 2);
        assert_eq!(f.pool.remove_participant(&"b".into()), 0);
        let keys: Vec<LinkKey> = f.pool.links().into_iter().map(|l| l.key).collect();
        assert_eq!(keys, vec![audio("c")]);
    }

    #[tokio::test]
    async fn events_after_removal_are_ignored() {
        let f = fixture("a");
        let mut rx = f.peer_rx;
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        let (sink, _) = f.connector.last();
        f.pool.remove_participant(&"b".into());

        sink.emit(PeerEvent::Connected(RemoteStream::new("s1")));
        assert!(f.pool.handle_peer_event(rx.recv().await.unwrap()).await.is_none());
        assert!(f.pool.links().is_empty());
    }

    #[tokio::test]
    async fn inbound_audio_flag_applies_to_existing_and_future_streams() {
        let f = fixture("a");
        let mut rx = f.peer_rx;
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        let (sink_b, _) = f.connector.last();
        let stream_b = RemoteStream::new("sb");
        sink_b.emit(PeerEvent::Connected(stream_b.clone()));
        f.pool.handle_peer_event(rx.recv().await.unwrap()).await;

        f.pool.set_inbound_audio_enabled(false);
        assert!(!stream_b.is_audio_enabled());

        f.pool.open_link("c".into(), LinkKind::Audio, Role::Initiator).await;
        let (sink_c, _) = f.connector.last();
        let stream_c = RemoteStream::new("sc");
        sink_c.emit(PeerEvent::Connected(stream_c.clone()));
        f.pool.handle_peer_event(rx.recv().await.unwrap()).await;
        assert!(!stream_c.is_audio_enabled());

        f.pool.set_inbound_audio_enabled(true);
        assert!(stream_b.is_audio_enabled());
        assert!(stream_c.is_audio_enabled());
    }

    #[tokio::test]
    async fn screen_signals_carry_sharer() {
        let f = fixture("a");
        f.pool.set_local_screen(Some(LocalTrack::new(crate::transport::MediaKind::Screen)));
        f.pool.open_link("b".into(), LinkKind::OutboundScreen, Role::Initiator).await;
        match &f.relay.take()[..] {
            [RelayMessage::ScreenSignal { to, sharer, .. }] => {
                assert_eq!(to.as_str(), "b");
                assert_eq!(sharer.as_str(), "a");
            }
            other => panic!("expected one screen signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_screen_needs_a_local_screen() {
        let f = fixture("a");
        assert!(f.pool.open_link("b".into(), LinkKind::OutboundScreen, Role::Initiator).await.is_none());
        assert_eq!(f.connector.count(), 0);
        assert!(f.pool.links().is_empty());
        assert!(f.relay.take().is_empty());
    }

    struct SlowConnector {
        inner: StubConnector,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl PeerConnector for SlowConnector {
        async fn open(&self, request: ConnectRequest, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
            tokio::time::sleep(self.delay).await;
            self.inner.open(request, events).await
        }
    }

    #[tokio::test]
    async fn share_ending_mid_connect_drops_outbound_screen_link() {
        let relay = Arc::new(RecordingRelay::default());
        let connector = Arc::new(SlowConnector {
            inner: StubConnector::default(),
            delay: std::time::Duration::from_millis(30),
        });
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let pool = PeerConnectionPool::new("a".into(), "c1".into(), connector.clone(), relay.clone(), None, peer_tx);
        pool.set_local_screen(Some(LocalTrack::new(crate::transport::MediaKind::Screen)));

        let opening = tokio::spawn({
            let pool = pool.clone();
            async move { pool.open_link("b".into(), LinkKind::OutboundScreen, Role::Initiator).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pool.set_local_screen(None);
        assert!(opening.await.unwrap().is_none());

        assert!(pool.links().is_empty());
        assert!(relay.take().is_empty());
        let (_, conn) = connector.inner.last();
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_new_links() {
        let f = fixture("a");
        f.pool.open_link("b".into(), LinkKind::Audio, Role::Initiator).await;
        let (_, conn) = f.connector.last();
        f.pool.close_all();
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);

        f.pool.open_link("c".into(), LinkKind::Audio, Role::Initiator).await;
        f.pool
            .handle_signal(audio("d"), SignalPayload::Offer { sdp: "v=0".into() })
            .await;
        assert!(f.pool.links().is_empty());
    }
}
