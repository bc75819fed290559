//! Signaling relay over a JSON-framed WebSocket.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::errors::VoiceError;
use crate::participants::{ChannelId, ParticipantId};
use crate::signaling::{
    events, ChannelStatePayload, ParticipantSummary, RelayEvent, RelayFrame, RelayMessage,
    RelayRegistration, SignalingRelay,
};

#[derive(Debug, Clone)]
pub struct WsRelayConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    pub connect_timeout: Duration,
    /// How long to wait for the channel snapshot after a join request.
    pub registration_timeout: Duration,
}

impl WsRelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(15),
            registration_timeout: Duration::from_secs(10),
        }
    }
}

/// Check that `url` is a WebSocket endpoint.
pub fn validate_relay_url(url: &str) -> Result<url::Url, VoiceError> {
    let parsed = url::Url::parse(url).map_err(|e| VoiceError::Config(format!("relay url {url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(VoiceError::Config(format!(
            "relay url must use ws or wss, got {other}"
        ))),
    }
}

#[derive(Default)]
struct WsShared {
    connected: bool,
    events: Option<mpsc::UnboundedSender<RelayEvent>>,
    pending_state: Option<oneshot::Sender<ChannelStatePayload>>,
}

/// `SignalingRelay` backed by one WebSocket connection.
///
/// A writer task drains outbound frames; a reader task decodes inbound
/// frames and routes them to the registered channel. When the socket
/// closes the channel stream receives `RelayEvent::Disconnected`.
pub struct WsRelay {
    local_id: ParticipantId,
    registration_timeout: Duration,
    outbound: mpsc::UnboundedSender<WsMessage>,
    shared: Arc<Mutex<WsShared>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsRelay {
    pub async fn connect(config: WsRelayConfig, local_id: ParticipantId) -> Result<Self, VoiceError> {
        let url = validate_relay_url(&config.url)?;
        info!(url = %url.host_str().unwrap_or(""), "connecting to signaling relay");

        let (ws_stream, _) = tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| VoiceError::Relay(format!("connection timed out after {:?}", config.connect_timeout)))?
        .map_err(|e| VoiceError::Relay(format!("connection failed: {e}")))?;

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(Mutex::new(WsShared {
            connected: true,
            ..WsShared::default()
        }));

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = ws_write.send(msg).await {
                    warn!(error = %e, "relay write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => dispatch(&reader_shared, frame),
                        Err(_) => debug!(text = %text, "unrecognized relay message"),
                    },
                    Ok(WsMessage::Close(_)) => {
                        info!("signaling relay closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "relay socket error");
                        break;
                    }
                    _ => {}
                }
            }

            let mut shared = lock(&reader_shared);
            shared.connected = false;
            shared.pending_state = None;
            if let Some(events) = shared.events.take() {
                let _ = events.send(RelayEvent::Disconnected);
            }
        });

        Ok(Self {
            local_id,
            registration_timeout: config.registration_timeout,
            outbound,
            shared,
            reader,
            writer,
        })
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).connected
    }

    fn send_frame(&self, frame: &RelayFrame) -> Result<(), VoiceError> {
        let json = serde_json::to_string(frame).map_err(|e| VoiceError::Relay(e.to_string()))?;
        self.outbound
            .send(WsMessage::Text(json.into()))
            .map_err(|_| VoiceError::RelayDisconnected)
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn lock(shared: &Mutex<WsShared>) -> MutexGuard<'_, WsShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dispatch(shared: &Mutex<WsShared>, frame: RelayFrame) {
    if frame.event == events::VOICE_CHANNEL_STATE {
        let pending = lock(shared).pending_state.take();
        match (pending, frame.into_channel_state()) {
            (Some(tx), Ok(state)) => {
                let _ = tx.send(state);
            }
            (None, _) => debug!("unsolicited channel state ignored"),
            (_, Err(e)) => warn!("bad channel state: {e}"),
        }
        return;
    }

    match RelayEvent::decode(&frame) {
        Ok(Some(event)) => {
            if let Some(events) = lock(shared).events.as_ref() {
                let _ = events.send(event);
            }
        }
        Ok(None) => debug!(event = %frame.event, "relay event ignored"),
        Err(e) => warn!("dropped relay frame: {e}"),
    }
}

#[async_trait]
impl SignalingRelay for WsRelay {
    async fn register(
        &self,
        channel_id: &ChannelId,
        local: &ParticipantSummary,
    ) -> Result<RelayRegistration, VoiceError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            if !shared.connected {
                return Err(VoiceError::RelayDisconnected);
            }
            shared.events = Some(events_tx);
            shared.pending_state = Some(state_tx);
        }

        self.send_frame(&RelayFrame::join(channel_id, local)?)?;

        let snapshot = match tokio::time::timeout(self.registration_timeout, state_rx).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(_)) => return Err(VoiceError::RelayDisconnected),
            Err(_) => {
                let mut shared = lock(&self.shared);
                shared.events = None;
                shared.pending_state = None;
                return Err(VoiceError::Relay("no channel state received".into()));
            }
        };

        if &snapshot.channel_id != channel_id {
            warn!(expected = %channel_id, got = %snapshot.channel_id, "channel state for another channel");
        }
        let participants = snapshot
            .participants
            .into_iter()
            .filter(|p| p.user_id != self.local_id)
            .collect();
        info!(channel = %channel_id, "registered with signaling relay");
        Ok(RelayRegistration { participants, events })
    }

    async fn unregister(&self, channel_id: &ChannelId) -> Result<(), VoiceError> {
        {
            let mut shared = lock(&self.shared);
            shared.events = None;
            shared.pending_state = None;
        }
        self.send_frame(&RelayFrame::leave(channel_id, &self.local_id)?)
    }

    async fn send(&self, message: RelayMessage) -> Result<(), VoiceError> {
        self.send_frame(&message.encode(&self.local_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalPayload;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> RelayFrame {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    async fn send_frame(ws: &mut WebSocketStream<TcpStream>, frame: &RelayFrame) {
        let json = serde_json::to_string(frame).unwrap();
        ws.send(WsMessage::Text(json.into())).await.unwrap();
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(validate_relay_url("wss://relay.example.com/voice").is_ok());
        assert!(matches!(
            validate_relay_url("https://relay.example.com"),
            Err(VoiceError::Config(_))
        ));
        assert!(matches!(validate_relay_url("not a url"), Err(VoiceError::Config(_))));
    }

    #[tokio::test]
    async fn registers_relays_and_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let (channel_id, participant) = next_frame(&mut ws).await.into_join_request().unwrap();
            assert_eq!(participant.user_id.as_str(), "u2");
            let snapshot = RelayFrame::channel_state(
                &channel_id,
                vec![ParticipantSummary::new("u1".into()), participant],
            )
            .unwrap();
            send_frame(&mut ws, &snapshot).await;
            send_frame(
                &mut ws,
                &RelayFrame {
                    event: events::USER_JOINED_VOICE.into(),
                    data: json!({"userId": "u3", "channelId": channel_id.as_str()}),
                },
            )
            .await;

            let signal = next_frame(&mut ws).await;
            ws.close(None).await.unwrap();
            signal
        });

        let relay = WsRelay::connect(WsRelayConfig::new(format!("ws://{addr}")), "u2".into())
            .await
            .unwrap();
        let mut registration = relay
            .register(&"c1".into(), &ParticipantSummary::new("u2".into()))
            .await
            .unwrap();

        let ids: Vec<&str> = registration.participants.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1"]);
        assert_eq!(
            registration.events.recv().await,
            Some(RelayEvent::UserJoined {
                user_id: "u3".into(),
                channel_id: "c1".into(),
                display_name: None,
            })
        );

        relay
            .send(RelayMessage::Signal {
                to: "u1".into(),
                channel_id: "c1".into(),
                signal: SignalPayload::Offer { sdp: "v=0".into() },
            })
            .await
            .unwrap();

        let signal = server.await.unwrap();
        assert_eq!(signal.event, events::VOICE_SIGNAL);
        assert_eq!(signal.data["userId"], "u1");
        assert_eq!(signal.data["signal"]["type"], "offer");

        assert_eq!(registration.events.recv().await, Some(RelayEvent::Disconnected));
        assert!(!relay.is_connected());
    }
}
