use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::errors::{DeviceError, VoiceError};
use crate::transport::MediaKind;

/// Buffered sample frames per track before slow readers start lagging.
const SAMPLE_QUEUE_FRAMES: usize = 64;

/// Microphone processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Screen capture preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenQuality {
    /// 720p, 30fps.
    Sd,
    /// 1080p, 60fps.
    #[default]
    Hd,
    /// 1080p, 144fps.
    Ultra,
}

impl ScreenQuality {
    /// Target capture size and rate. These are hints for the capture
    /// picker and encoder, not guarantees.
    pub fn constraints(self) -> ScreenConstraints {
        match self {
            Self::Sd => ScreenConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
            Self::Hd => ScreenConstraints {
                width: 1920,
                height: 1080,
                frame_rate: 60,
            },
            Self::Ultra => ScreenConstraints {
                width: 1920,
                height: 1080,
                frame_rate: 144,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

// ---------------------------------------------------------------------------
// Local tracks
// ---------------------------------------------------------------------------

struct TrackInner {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    samples: broadcast::Sender<Arc<[f32]>>,
}

/// A locally captured track.
///
/// Cloning shares the same underlying capture: every link that sends the
/// microphone holds a clone of one track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl LocalTrack {
    /// Create a track. Capture backends feed it through `push_samples`
    /// and call `stop` when the device ends capture.
    pub fn new(kind: MediaKind) -> Self {
        let (ended, _) = watch::channel(false);
        let (samples, _) = broadcast::channel(SAMPLE_QUEUE_FRAMES);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                enabled: AtomicBool::new(true),
                ended,
                samples,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Only `MediaTrackController` flips this flag.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Push a frame of mono PCM samples in [-1, 1]. Ignored once ended.
    pub fn push_samples(&self, samples: &[f32]) {
        if self.is_ended() {
            return;
        }
        let _ = self.inner.samples.send(Arc::from(samples));
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<Arc<[f32]>> {
        self.inner.samples.subscribe()
    }

    /// End capture. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, whoever ended it.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self, constraints: AudioConstraints) -> Result<LocalTrack, DeviceError>;

    async fn open_display(&self, constraints: ScreenConstraints) -> Result<LocalTrack, DeviceError>;
}

#[derive(Default)]
struct LocalMediaState {
    microphone: Option<LocalTrack>,
    screen: Option<(LocalTrack, ScreenQuality)>,
}

/// Controls for local media (microphone, screen capture).
///
/// Sole writer of the tracks' enabled flag. Links only ever hold clones.
#[derive(Clone)]
pub struct MediaTrackController {
    devices: Arc<dyn MediaDevices>,
    state: Arc<Mutex<LocalMediaState>>,
}

impl MediaTrackController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: Arc::new(Mutex::new(LocalMediaState::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LocalMediaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the microphone, or return the live track if one is already open.
    pub async fn acquire_microphone(&self, constraints: AudioConstraints) -> Result<LocalTrack, VoiceError> {
        if let Some(track) = self.microphone() {
            return Ok(track);
        }

        let track = self.devices.open_microphone(constraints).await.map_err(|e| {
            tracing::warn!("microphone unavailable: {e}");
            VoiceError::DeviceUnavailable(e)
        })?;

        let mut state = self.state();
        if let Some(existing) = state.microphone.as_ref().filter(|t| !t.is_ended()) {
            // A concurrent acquisition won; keep a single capture.
            track.stop();
            return Ok(existing.clone());
        }
        state.microphone = Some(track.clone());
        tracing::info!(track = track.id(), "microphone acquired");
        Ok(track)
    }

    pub fn microphone(&self) -> Option<LocalTrack> {
        self.state().microphone.clone().filter(|t| !t.is_ended())
    }

    /// Enable or disable the outbound microphone without touching the
    /// track or any connection carrying it. Returns false if no track is open.
    pub fn set_microphone_enabled(&self, enabled: bool) -> bool {
        match self.state().microphone.as_ref() {
            Some(track) => {
                track.set_enabled(enabled);
                tracing::info!("microphone enabled: {enabled}");
                true
            }
            None => false,
        }
    }

    /// Stop a track that arrived after its owner stopped wanting it.
    pub fn discard(&self, track: &LocalTrack) {
        track.stop();
        let mut state = self.state();
        if state.microphone.as_ref().is_some_and(|t| t.id() == track.id()) {
            state.microphone = None;
        }
        if state.screen.as_ref().is_some_and(|(t, _)| t.id() == track.id()) {
            state.screen = None;
        }
    }

    /// Open a display capture at the given preset. Returns the live capture
    /// if already sharing.
    pub async fn start_screen_share(&self, quality: ScreenQuality) -> Result<LocalTrack, VoiceError> {
        if let Some((track, _)) = self.screen_share() {
            return Ok(track);
        }

        let track = self
            .devices
            .open_display(quality.constraints())
            .await
            .map_err(|e| {
                tracing::warn!("screen capture refused: {e}");
                match e {
                    DeviceError::Cancelled | DeviceError::PermissionDenied => VoiceError::ScreenShareDenied,
                    other => VoiceError::DeviceUnavailable(other),
                }
            })?;

        let mut state = self.state();
        if let Some((existing, _)) = state.screen.as_ref().filter(|(t, _)| !t.is_ended()) {
            track.stop();
            return Ok(existing.clone());
        }
        state.screen = Some((track.clone(), quality));
        tracing::info!(track = track.id(), ?quality, "screen capture started");
        Ok(track)
    }

    pub fn screen_share(&self) -> Option<(LocalTrack, ScreenQuality)> {
        self.state().screen.clone().filter(|(t, _)| !t.is_ended())
    }

    /// Stop the screen capture. Returns the stopped track, or `None` if
    /// nothing was being shared.
    pub fn stop_screen_share(&self) -> Option<LocalTrack> {
        let (track, _) = self.state().screen.take()?;
        track.stop();
        tracing::info!(track = track.id(), "screen capture stopped");
        Some(track)
    }

    /// Stop every local track.
    pub fn release_all(&self) {
        let mut state = self.state();
        if let Some(track) = state.microphone.take() {
            track.stop();
        }
        if let Some((track, _)) = state.screen.take() {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDevices;

    #[test]
    fn presets_match_fixed_targets() {
        assert_eq!(
            ScreenQuality::Sd.constraints(),
            ScreenConstraints { width: 1280, height: 720, frame_rate: 30 }
        );
        assert_eq!(ScreenQuality::Hd.constraints().frame_rate, 60);
        assert_eq!(ScreenQuality::Ultra.constraints().frame_rate, 144);
        assert_eq!(ScreenQuality::Ultra.constraints().height, 1080);
    }

    #[tokio::test]
    async fn microphone_is_shared_not_copied() {
        let controller = MediaTrackController::new(Arc::new(LoopbackDevices::new()));
        let first = controller.acquire_microphone(AudioConstraints::default()).await.unwrap();
        let second = controller.acquire_microphone(AudioConstraints::default()).await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn denied_microphone_is_device_unavailable() {
        let devices = LoopbackDevices::new();
        devices.deny_microphone(DeviceError::PermissionDenied);
        let controller = MediaTrackController::new(Arc::new(devices));
        let err = controller
            .acquire_microphone(AudioConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::DeviceUnavailable(DeviceError::PermissionDenied)));
        assert!(controller.microphone().is_none());
    }

    #[tokio::test]
    async fn mute_flips_enabled_without_replacing_track() {
        let controller = MediaTrackController::new(Arc::new(LoopbackDevices::new()));
        let track = controller.acquire_microphone(AudioConstraints::default()).await.unwrap();

        assert!(controller.set_microphone_enabled(false));
        assert!(!track.is_enabled());
        assert!(!track.is_ended());

        assert!(controller.set_microphone_enabled(true));
        assert!(track.is_enabled());
        assert_eq!(controller.microphone().unwrap().id(), track.id());
    }

    #[tokio::test]
    async fn cancelled_picker_is_screen_share_denied() {
        let devices = LoopbackDevices::new();
        devices.deny_display(DeviceError::Cancelled);
        let controller = MediaTrackController::new(Arc::new(devices));
        let err = controller.start_screen_share(ScreenQuality::Hd).await.unwrap_err();
        assert!(matches!(err, VoiceError::ScreenShareDenied));
    }

    #[tokio::test]
    async fn stop_screen_share_is_idempotent() {
        let controller = MediaTrackController::new(Arc::new(LoopbackDevices::new()));
        let track = controller.start_screen_share(ScreenQuality::Sd).await.unwrap();

        let stopped = controller.stop_screen_share().unwrap();
        assert_eq!(stopped.id(), track.id());
        assert!(track.is_ended());
        assert!(controller.stop_screen_share().is_none());
    }

    #[tokio::test]
    async fn release_all_ends_every_track() {
        let controller = MediaTrackController::new(Arc::new(LoopbackDevices::new()));
        let mic = controller.acquire_microphone(AudioConstraints::default()).await.unwrap();
        let screen = controller.start_screen_share(ScreenQuality::Hd).await.unwrap();

        controller.release_all();
        assert!(mic.is_ended());
        assert!(screen.is_ended());
        assert!(controller.microphone().is_none());
        assert!(controller.screen_share().is_none());
    }

    #[tokio::test]
    async fn ended_resolves_after_out_of_band_stop() {
        let track = LocalTrack::new(MediaKind::Screen);
        let waiter = track.clone();
        let handle = tokio::spawn(async move { waiter.ended().await });
        track.stop();
        handle.await.unwrap();
        assert!(track.is_ended());
    }
}
