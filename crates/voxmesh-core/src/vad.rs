//! Voice activity detection on the local microphone.
//!
//! Volume is taken from the magnitude spectrum of a fixed window of
//! samples and normalized so a full-scale sine reads 1.0. Speaking is a
//! plain threshold on that volume: no hangover, no hysteresis.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use tokio::sync::broadcast::error::RecvError;

use crate::media::LocalTrack;

/// About 0.5% of full scale.
pub const DEFAULT_SPEAKING_THRESHOLD: f32 = 0.005;

/// Samples per analysis window.
pub const ANALYSIS_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Volume strictly above this is speech.
    pub threshold: f32,
    pub window: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPEAKING_THRESHOLD,
            window: ANALYSIS_WINDOW,
        }
    }
}

/// Edge-triggered speaking detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    /// Samples of the window being filled; the transform overwrites it.
    input: Vec<f32>,
    filled: usize,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    speaking: bool,
    volume: f32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let window = config.window.max(2);
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(window);
        Self {
            config: VadConfig { window, ..config },
            input: fft.make_input_vec(),
            filled: 0,
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            fft,
            speaking: false,
            volume: 0.0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Volume of the last complete window, in [0, 1].
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Feed captured samples. `on_edge` fires once per speaking transition,
    /// never per window.
    pub fn feed(&mut self, samples: &[f32], muted: bool, mut on_edge: impl FnMut(bool)) {
        for &sample in samples {
            self.input[self.filled] = sample;
            self.filled += 1;
            if self.filled == self.config.window {
                self.filled = 0;
                let volume = self.window_volume();
                if let Some(speaking) = self.update(volume, muted) {
                    on_edge(speaking);
                }
            }
        }
    }

    /// Normalized spectral magnitude of the full input window.
    ///
    /// Sums the power of every bin of the real spectrum, counting the
    /// mirrored half twice, and scales so a full-scale sine maps to 1.0.
    fn window_volume(&mut self) -> f32 {
        if let Err(e) = self
            .fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
        {
            tracing::warn!("spectrum analysis failed: {e}");
            return 0.0;
        }

        let n = self.config.window;
        let power: f32 = self
            .spectrum
            .iter()
            .enumerate()
            .map(|(k, bin)| {
                let mirrored = k != 0 && 2 * k != n;
                if mirrored { 2.0 * bin.norm_sqr() } else { bin.norm_sqr() }
            })
            .sum();

        let nf = n as f32;
        (2.0 * power / (nf * nf)).sqrt().clamp(0.0, 1.0)
    }

    /// Apply one window's volume. Returns the new state on an edge.
    pub fn update(&mut self, volume: f32, muted: bool) -> Option<bool> {
        self.volume = volume;
        let speaking = !muted && volume > self.config.threshold;
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    /// Analyze `track` until it ends. Muting is read from the track's
    /// enabled flag. A speaking state still open when the track ends is
    /// closed with a final `false`.
    pub async fn run(mut self, track: LocalTrack, mut on_edge: impl FnMut(bool) + Send) {
        let mut samples = track.subscribe_samples();
        tracing::debug!(track = track.id(), "voice activity detection started");
        loop {
            tokio::select! {
                biased;
                _ = track.ended() => break,
                frame = samples.recv() => match frame {
                    Ok(frame) => {
                        let muted = !track.is_enabled();
                        self.feed(&frame, muted, &mut on_edge);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("voice activity detection skipped {skipped} frames");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        if self.speaking {
            self.speaking = false;
            on_edge(false);
        }
        tracing::debug!(track = track.id(), "voice activity detection stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MediaKind;
    use std::f32::consts::PI;

    fn sine(amplitude: f32, cycles: usize, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * cycles as f32 * i as f32 / len as f32).sin())
            .collect()
    }

    /// Volume the detector reports after exactly one window.
    fn volume_of(window: &[f32]) -> f32 {
        let mut vad = VoiceActivityDetector::new(VadConfig {
            window: window.len(),
            ..VadConfig::default()
        });
        vad.feed(window, false, |_| {});
        vad.volume()
    }

    #[test]
    fn silence_has_zero_volume() {
        assert_eq!(volume_of(&[0.0; ANALYSIS_WINDOW]), 0.0);
    }

    #[test]
    fn full_scale_sine_reads_one() {
        let volume = volume_of(&sine(1.0, 8, ANALYSIS_WINDOW));
        assert!((volume - 1.0).abs() < 1e-2, "volume {volume}");
    }

    #[test]
    fn volume_scales_with_amplitude() {
        let volume = volume_of(&sine(0.25, 16, ANALYSIS_WINDOW));
        assert!((volume - 0.25).abs() < 1e-2, "volume {volume}");
    }

    #[test]
    fn odd_windows_keep_the_normalization() {
        let volume = volume_of(&sine(1.0, 5, 441));
        assert!((volume - 1.0).abs() < 1e-2, "volume {volume}");
    }

    #[test]
    fn consecutive_windows_are_measured_independently() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.feed(&sine(1.0, 8, ANALYSIS_WINDOW), false, |_| {});
        assert!((vad.volume() - 1.0).abs() < 1e-2);
        vad.feed(&sine(0.25, 8, ANALYSIS_WINDOW), false, |_| {});
        assert!((vad.volume() - 0.25).abs() < 1e-2, "volume {}", vad.volume());
        vad.feed(&[0.0; ANALYSIS_WINDOW], false, |_| {});
        assert_eq!(vad.volume(), 0.0);
    }

    #[test]
    fn one_crossing_each_way_emits_two_edges() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        let volumes = [0.0, 0.001, 0.2, 0.3, 0.25, 0.1, 0.002, 0.0, 0.0];
        let edges: Vec<bool> = volumes.iter().filter_map(|&v| vad.update(v, false)).collect();
        assert_eq!(edges, vec![true, false]);
    }

    #[test]
    fn volume_at_threshold_is_not_speaking() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert_eq!(vad.update(DEFAULT_SPEAKING_THRESHOLD, false), None);
        assert!(!vad.is_speaking());
        assert_eq!(vad.update(0.5, false), Some(true));
        assert_eq!(vad.update(DEFAULT_SPEAKING_THRESHOLD, false), Some(false));
    }

    #[test]
    fn muted_track_never_speaks() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert_eq!(vad.update(0.8, true), None);
        assert_eq!(vad.update(0.8, false), Some(true));
        assert_eq!(vad.update(0.8, true), Some(false));
    }

    #[test]
    fn feed_reports_edges_per_window_not_per_sample() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        let mut edges = Vec::new();
        let loud = sine(0.5, 8, ANALYSIS_WINDOW);

        // Three loud windows then two silent windows, in uneven chunks.
        let mut signal = Vec::new();
        for _ in 0..3 {
            signal.extend_from_slice(&loud);
        }
        signal.extend(std::iter::repeat_n(0.0, 2 * ANALYSIS_WINDOW));
        for chunk in signal.chunks(300) {
            vad.feed(chunk, false, |s| edges.push(s));
        }

        assert_eq!(edges, vec![true, false]);
    }

    #[tokio::test]
    async fn run_closes_open_speaking_state_when_track_ends() {
        let track = LocalTrack::new(MediaKind::Audio);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let vad = VoiceActivityDetector::new(VadConfig::default());
        let handle = tokio::spawn(vad.run(track.clone(), move |s| {
            let _ = tx.send(s);
        }));

        // Let the detector subscribe before pushing.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        track.push_samples(&sine(0.5, 8, ANALYSIS_WINDOW));
        assert_eq!(rx.recv().await, Some(true));

        track.stop();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, None);
    }
}
