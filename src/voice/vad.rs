//! Voice-activity detection
//!
//! A detector watches the microphone tap and reports speech boundaries as
//! [`VadSignal`]s through a sink. It only reports while started; pausing
//! resets its state so a resumed detector never ends speech it did not see
//! begin.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::SampleTap;
use crate::Result;

/// How often the energy detector reads the tap; one read is one frame
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// RMS level that maps to a speech score of 1.0
const FULL_SCALE_RMS: f32 = 0.06;

/// Speech boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadSignal {
    SpeechStart,
    SpeechEnd,
}

/// Receiver of detector signals
pub type VadSink = Arc<dyn Fn(VadSignal) + Send + Sync>;

/// A running voice-activity detector
pub trait VoiceActivityDetector: Send {
    /// Begin reporting
    fn start(&mut self);

    /// Stop reporting and forget any speech in progress
    fn pause(&mut self);

    /// Stop for good and free resources
    fn destroy(&mut self);
}

/// Creates detectors bound to a microphone tap
#[async_trait]
pub trait VadProvider: Send + Sync {
    /// Create a paused detector reading `tap` and reporting to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if the detector cannot be initialized
    async fn create(&self, tap: SampleTap, sink: VadSink) -> Result<Box<dyn VoiceActivityDetector>>;
}

/// Score thresholds for segmenting speech
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadThresholds {
    /// Frames scoring at or above this start (or sustain) speech
    pub positive: f32,
    /// Frames scoring below this count towards ending speech
    pub negative: f32,
    /// Consecutive negative frames that end speech
    pub redemption_frames: u32,
}

impl Default for VadThresholds {
    fn default() -> Self {
        Self {
            positive: 0.5,
            negative: 0.35,
            redemption_frames: 8,
        }
    }
}

/// Frame-by-frame speech state machine
#[derive(Debug, Clone)]
pub struct SpeechSegmenter {
    thresholds: VadThresholds,
    speaking: bool,
    quiet_frames: u32,
}

impl SpeechSegmenter {
    /// Create an idle segmenter
    #[must_use]
    pub const fn new(thresholds: VadThresholds) -> Self {
        Self {
            thresholds,
            speaking: false,
            quiet_frames: 0,
        }
    }

    /// Whether speech is in progress
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one frame of samples
    pub fn process(&mut self, frame: &[f32]) -> Option<VadSignal> {
        let score = speech_score(frame);

        if !self.speaking {
            if score >= self.thresholds.positive {
                self.speaking = true;
                self.quiet_frames = 0;
                tracing::trace!(score, "speech started");
                return Some(VadSignal::SpeechStart);
            }
            return None;
        }

        if score >= self.thresholds.positive {
            self.quiet_frames = 0;
        } else if score < self.thresholds.negative {
            self.quiet_frames += 1;
            if self.quiet_frames >= self.thresholds.redemption_frames {
                self.reset();
                tracing::trace!(score, "speech ended");
                return Some(VadSignal::SpeechEnd);
            }
        }

        None
    }

    /// Back to idle
    pub const fn reset(&mut self) {
        self.speaking = false;
        self.quiet_frames = 0;
    }
}

/// Map RMS energy onto a 0..=1 speech score
#[must_use]
pub fn speech_score(samples: &[f32]) -> f32 {
    (calculate_energy(samples) / FULL_SCALE_RMS).min(1.0)
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Provider of [`EnergyVad`] detectors
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyVadProvider {
    thresholds: VadThresholds,
}

impl EnergyVadProvider {
    #[must_use]
    pub const fn new(thresholds: VadThresholds) -> Self {
        Self { thresholds }
    }
}

#[async_trait]
impl VadProvider for EnergyVadProvider {
    async fn create(&self, tap: SampleTap, sink: VadSink) -> Result<Box<dyn VoiceActivityDetector>> {
        Ok(Box::new(EnergyVad::spawn(tap, self.thresholds, sink)))
    }
}

/// RMS-energy detector polling the tap every [`POLL_INTERVAL`]
pub struct EnergyVad {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl EnergyVad {
    /// Start the polling task in the paused state
    #[must_use]
    pub fn spawn(tap: SampleTap, thresholds: VadThresholds, sink: VadSink) -> Self {
        let active = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&active);

        let task = tokio::spawn(async move {
            let mut segmenter = SpeechSegmenter::new(thresholds);
            let mut ticker = time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let frame = tap.take();

                if !flag.load(Ordering::Acquire) {
                    segmenter.reset();
                    continue;
                }
                if let Some(signal) = segmenter.process(&frame) {
                    sink(signal);
                }
            }
        });

        tracing::debug!(
            positive = thresholds.positive,
            negative = thresholds.negative,
            redemption_frames = thresholds.redemption_frames,
            "energy vad initialized"
        );

        Self {
            active,
            task: Some(task),
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn start(&mut self) {
        self.active.store(true, Ordering::Release);
    }

    fn pause(&mut self) {
        self.active.store(false, Ordering::Release);
    }

    fn destroy(&mut self) {
        self.pause();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EnergyVad {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const LOUD: [f32; 160] = [0.2; 160];
    const QUIET: [f32; 160] = [0.001; 160];

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_energy(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_energy(&loud) > 0.4);
        assert!((speech_score(&loud) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn speech_ends_after_redemption_window() {
        let mut seg = SpeechSegmenter::new(VadThresholds::default());

        assert_eq!(seg.process(&QUIET), None);
        assert_eq!(seg.process(&LOUD), Some(VadSignal::SpeechStart));

        for _ in 0..7 {
            assert_eq!(seg.process(&QUIET), None);
        }
        assert_eq!(seg.process(&QUIET), Some(VadSignal::SpeechEnd));
        assert!(!seg.is_speaking());
    }

    #[test]
    fn loud_frame_resets_redemption() {
        let mut seg = SpeechSegmenter::new(VadThresholds {
            redemption_frames: 3,
            ..VadThresholds::default()
        });
        seg.process(&LOUD);

        seg.process(&QUIET);
        seg.process(&QUIET);
        assert_eq!(seg.process(&LOUD), None);
        seg.process(&QUIET);
        seg.process(&QUIET);
        assert!(seg.is_speaking());
        assert_eq!(seg.process(&QUIET), Some(VadSignal::SpeechEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_detector_reports_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: VadSink = Arc::new(move |s| sink_seen.lock().unwrap().push(s));

        let tap = SampleTap::new(1600);
        let mut vad = EnergyVad::spawn(tap.clone(), VadThresholds::default(), sink);

        tap.push(&LOUD);
        time::sleep(POLL_INTERVAL * 2).await;
        assert!(seen.lock().unwrap().is_empty());

        vad.start();
        tap.push(&LOUD);
        time::sleep(POLL_INTERVAL * 2).await;
        assert_eq!(*seen.lock().unwrap(), vec![VadSignal::SpeechStart]);

        vad.destroy();
    }
}
