use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::errors::VoiceError;
use crate::media::{AudioConstraints, ScreenQuality};
use crate::session::SessionConfig;
use crate::vad::{VadConfig, DEFAULT_SPEAKING_THRESHOLD};
use crate::ws_relay::validate_relay_url;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VoiceSettings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
    #[serde(default)]
    pub screen_quality: ScreenQuality,
    #[serde(default = "default_threshold")]
    pub speaking_threshold: f32,
    #[serde(default)]
    pub join_muted: bool,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f32 {
    DEFAULT_SPEAKING_THRESHOLD
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            display_name: None,
            relay_url: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            screen_quality: ScreenQuality::default(),
            speaking_threshold: DEFAULT_SPEAKING_THRESHOLD,
            join_muted: false,
        }
    }
}

impl From<&VoiceSettings> for SessionConfig {
    fn from(settings: &VoiceSettings) -> Self {
        Self {
            display_name: settings.display_name.clone(),
            audio: AudioConstraints {
                echo_cancellation: settings.echo_cancellation,
                noise_suppression: settings.noise_suppression,
                auto_gain_control: settings.auto_gain_control,
            },
            screen_quality: settings.screen_quality,
            vad: VadConfig {
                threshold: settings.speaking_threshold.clamp(0.0, 1.0),
                ..VadConfig::default()
            },
            join_muted: settings.join_muted,
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<VoiceSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VoiceSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> VoiceSettings {
        self.lock().clone()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&*self.lock())
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    /// Rejects anything that is not a `ws://` or `wss://` URL.
    pub fn set_relay_url(&self, url: Option<String>) -> Result<(), VoiceError> {
        if let Some(url) = &url {
            validate_relay_url(url)?;
        }
        self.lock().relay_url = url;
        self.save();
        Ok(())
    }

    pub fn set_audio_processing(&self, constraints: AudioConstraints) {
        {
            let mut settings = self.lock();
            settings.echo_cancellation = constraints.echo_cancellation;
            settings.noise_suppression = constraints.noise_suppression;
            settings.auto_gain_control = constraints.auto_gain_control;
        }
        self.save();
    }

    pub fn set_screen_quality(&self, quality: ScreenQuality) {
        self.lock().screen_quality = quality;
        self.save();
    }

    pub fn set_speaking_threshold(&self, threshold: f32) -> Result<(), VoiceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(VoiceError::Config(format!(
                "speaking threshold must be within [0, 1], got {threshold}"
            )));
        }
        self.lock().speaking_threshold = threshold;
        self.save();
        Ok(())
    }

    pub fn set_join_muted(&self, muted: bool) {
        self.lock().join_muted = muted;
        self.save();
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!(path = %self.file_path.display(), "settings not saved: {e}");
                }
            }
            Err(e) => tracing::warn!("settings not serialized: {e}"),
        }
    }

    fn load(path: &Path) -> VoiceSettings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "corrupt settings, using defaults: {e}");
                VoiceSettings::default()
            }),
            Err(_) => VoiceSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_default_settings() {
        let s = VoiceSettings::default();
        assert_eq!(s.display_name, None);
        assert_eq!(s.relay_url, None);
        assert!(s.echo_cancellation && s.noise_suppression && s.auto_gain_control);
        assert_eq!(s.screen_quality, ScreenQuality::Hd);
        assert_eq!(s.speaking_threshold, DEFAULT_SPEAKING_THRESHOLD);
        assert!(!s.join_muted);
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), VoiceSettings::default());
    }

    #[test]
    fn test_set_display_name_persists() {
        let dir = temp_dir();
        {
            let store = SettingsStore::new(dir.path());
            store.set_display_name(Some("Alice".to_string()));
        }
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get().display_name, Some("Alice".to_string()));
    }

    #[test]
    fn test_relay_url_must_be_websocket() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path());
        assert!(matches!(
            store.set_relay_url(Some("http://relay.local".into())),
            Err(VoiceError::Config(_))
        ));
        assert_eq!(store.get().relay_url, None);

        store.set_relay_url(Some("wss://relay.local/voice".into())).unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get().relay_url.as_deref(), Some("wss://relay.local/voice"));
    }

    #[test]
    fn test_audio_and_screen_preferences_persist() {
        let dir = temp_dir();
        {
            let store = SettingsStore::new(dir.path());
            store.set_audio_processing(AudioConstraints {
                echo_cancellation: false,
                noise_suppression: true,
                auto_gain_control: false,
            });
            store.set_screen_quality(ScreenQuality::Ultra);
            store.set_join_muted(true);
        }
        let s = SettingsStore::new(dir.path()).get();
        assert!(!s.echo_cancellation);
        assert!(s.noise_suppression);
        assert!(!s.auto_gain_control);
        assert_eq!(s.screen_quality, ScreenQuality::Ultra);
        assert!(s.join_muted);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path());
        assert!(store.set_speaking_threshold(1.5).is_err());
        store.set_speaking_threshold(0.02).unwrap();
        assert_eq!(store.get().speaking_threshold, 0.02);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        fs::write(dir.path().join("settings.json"), "not json!!!").unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), VoiceSettings::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("settings.json"),
            r#"{"display_name":"Eve","screen_quality":"sd"}"#,
        )
        .unwrap();
        let s = SettingsStore::new(dir.path()).get();
        assert_eq!(s.display_name, Some("Eve".to_string()));
        assert_eq!(s.screen_quality, ScreenQuality::Sd);
        assert!(s.echo_cancellation);
        assert!(!s.join_muted);
    }

    #[test]
    fn test_session_config_follows_settings() {
        let dir = temp_dir();
        let store = SettingsStore::new(dir.path());
        store.set_display_name(Some("Dana".into()));
        store.set_join_muted(true);
        store.set_speaking_threshold(0.01).unwrap();

        let config = store.session_config();
        assert_eq!(config.display_name.as_deref(), Some("Dana"));
        assert!(config.join_muted);
        assert_eq!(config.vad.threshold, 0.01);
        assert_eq!(config.audio, AudioConstraints::default());
        assert_eq!(config.screen_quality, ScreenQuality::Hd);
    }
}
