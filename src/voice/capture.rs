//! Utterance capture driven by voice activity or manual control

use std::time::Instant;

use super::{
    CaptureConstraints, Microphone, MicrophoneProvider, SampleTap, VadSignal,
    VoiceActivityDetector,
};
use crate::{DeviceError, Error, Result};

/// What started a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingTrigger {
    Voice,
    Manual,
}

/// The recording in progress
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: u64,
    pub trigger: RecordingTrigger,
    pub started_at: Instant,
}

/// A finished recording waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub recording_id: u64,
    pub trigger: RecordingTrigger,
    pub format: String,
    pub payload: Vec<u8>,
}

/// Effect of a voice-activity signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadOutcome {
    Ignored,
    Started(u64),
    /// Recording stopped; send once the settle delay passes
    Stopped {
        recording_id: u64,
        size: usize,
        format: String,
    },
}

/// Owns the microphone and the detector and turns speech into utterances
pub struct VoiceCapture {
    enable_vad: bool,
    microphone: Option<Box<dyn Microphone>>,
    detector: Option<Box<dyn VoiceActivityDetector>>,
    listening: bool,
    recording: Option<RecordingSession>,
    pending: Option<Utterance>,
    next_recording_id: u64,
}

impl VoiceCapture {
    #[must_use]
    pub const fn new(enable_vad: bool) -> Self {
        Self {
            enable_vad,
            microphone: None,
            detector: None,
            listening: false,
            recording: None,
            pending: None,
            next_recording_id: 0,
        }
    }

    /// Take ownership of an acquired microphone and its detector
    pub fn attach(
        &mut self,
        microphone: Box<dyn Microphone>,
        detector: Option<Box<dyn VoiceActivityDetector>>,
    ) {
        self.teardown();
        tracing::info!(
            format = microphone.format(),
            vad = detector.is_some(),
            "voice capture ready"
        );
        self.microphone = Some(microphone);
        self.detector = detector;
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.microphone.is_some()
    }

    /// Whether detection was requested in configuration
    #[must_use]
    pub const fn vad_enabled(&self) -> bool {
        self.enable_vad
    }

    /// Whether a detector is attached
    #[must_use]
    pub const fn vad_ready(&self) -> bool {
        self.detector.is_some()
    }

    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    #[must_use]
    pub const fn recording(&self) -> Option<&RecordingSession> {
        self.recording.as_ref()
    }

    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Sample feed of the attached microphone
    #[must_use]
    pub fn tap(&self) -> Option<SampleTap> {
        self.microphone.as_ref().map(|m| m.tap())
    }

    /// Arm or disarm detection, returning the new listening state
    ///
    /// Without a detector this stays disarmed.
    pub fn toggle_listening(&mut self) -> bool {
        let Some(detector) = self.detector.as_mut() else {
            tracing::warn!("voice activity detection not initialized");
            return false;
        };

        self.listening = !self.listening;
        if self.listening {
            detector.start();
        } else {
            detector.pause();
        }
        tracing::info!(listening = self.listening, "listening toggled");
        self.listening
    }

    /// Disarm detection
    pub fn stop_listening(&mut self) {
        if let Some(detector) = self.detector.as_mut() {
            detector.pause();
        }
        self.listening = false;
    }

    /// React to a detector signal
    ///
    /// # Errors
    ///
    /// Returns error if the recorder fails to start or stop
    pub fn on_vad(&mut self, signal: VadSignal) -> Result<VadOutcome> {
        if !self.listening {
            return Ok(VadOutcome::Ignored);
        }

        match signal {
            VadSignal::SpeechStart => Ok(self
                .start_recording(RecordingTrigger::Voice)?
                .map_or(VadOutcome::Ignored, VadOutcome::Started)),
            VadSignal::SpeechEnd => {
                let voice = self
                    .recording
                    .as_ref()
                    .is_some_and(|r| r.trigger == RecordingTrigger::Voice);
                if !voice {
                    return Ok(VadOutcome::Ignored);
                }
                Ok(self
                    .stop_recording()?
                    .map_or(VadOutcome::Ignored, |u| VadOutcome::Stopped {
                        recording_id: u.recording_id,
                        size: u.payload.len(),
                        format: u.format,
                    }))
            }
        }
    }

    /// Begin a recording; `None` if one is already running
    ///
    /// # Errors
    ///
    /// Returns error if no microphone is attached or the recorder fails
    pub fn start_recording(&mut self, trigger: RecordingTrigger) -> Result<Option<u64>> {
        if self.recording.is_some() {
            return Ok(None);
        }
        let microphone = self
            .microphone
            .as_mut()
            .ok_or_else(|| DeviceError::Unavailable("microphone not initialized".to_string()))?;

        microphone.start_recorder()?;
        self.next_recording_id += 1;
        let id = self.next_recording_id;
        self.recording = Some(RecordingSession {
            id,
            trigger,
            started_at: Instant::now(),
        });
        tracing::debug!(recording_id = id, ?trigger, "recording started");
        Ok(Some(id))
    }

    /// Finish the recording and keep it as the pending utterance
    ///
    /// Returns a copy of the utterance, or `None` if nothing was recording.
    ///
    /// # Errors
    ///
    /// Returns error if encoding the recording fails
    pub fn stop_recording(&mut self) -> Result<Option<Utterance>> {
        let Some(session) = self.recording.take() else {
            return Ok(None);
        };
        let microphone = self.microphone.as_mut().ok_or(Error::NoRecording)?;

        let payload = microphone.stop_recorder()?;
        let utterance = Utterance {
            recording_id: session.id,
            trigger: session.trigger,
            format: microphone.format().to_string(),
            payload,
        };
        tracing::debug!(
            recording_id = session.id,
            size = utterance.payload.len(),
            elapsed_ms = u64::try_from(session.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "recording stopped"
        );

        self.pending = Some(utterance.clone());
        Ok(Some(utterance))
    }

    /// Take the pending utterance
    ///
    /// With `recording_id` set, only that recording is taken; a newer
    /// recording stays pending.
    pub fn take_pending(&mut self, recording_id: Option<u64>) -> Option<Utterance> {
        match (recording_id, self.pending.as_ref()) {
            (Some(id), Some(u)) if u.recording_id != id => None,
            _ => self.pending.take(),
        }
    }

    /// Abandon any recording and disarm detection, keeping the microphone
    ///
    /// Returns the id of the recording that was cut off.
    pub fn interrupt(&mut self) -> Option<u64> {
        self.stop_listening();
        self.pending = None;

        let session = self.recording.take()?;
        if let Some(microphone) = self.microphone.as_mut() {
            if let Err(e) = microphone.stop_recorder() {
                tracing::debug!(error = %e, "discarding interrupted recording failed");
            }
        }
        tracing::debug!(recording_id = session.id, "recording interrupted");
        Some(session.id)
    }

    /// Interrupt and release the detector and the microphone
    pub fn teardown(&mut self) {
        self.interrupt();
        if let Some(mut detector) = self.detector.take() {
            detector.destroy();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
            tracing::debug!("microphone released");
        }
    }
}

impl Drop for VoiceCapture {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Acquire a microphone, retrying once with minimal constraints
///
/// Returns the microphone and whether the fallback was needed.
///
/// # Errors
///
/// Returns the device error of the last attempt
pub async fn acquire_with_fallback(
    provider: &dyn MicrophoneProvider,
    preferred: &CaptureConstraints,
) -> Result<(Box<dyn Microphone>, bool)> {
    match provider.acquire(preferred).await {
        Ok(mic) => Ok((mic, false)),
        Err(Error::Device(DeviceError::ConstraintsUnsupported(detail))) => {
            tracing::warn!(%detail, "capture constraints unsupported, retrying with minimal");
            let mic = provider.acquire(&CaptureConstraints::minimal()).await?;
            Ok((mic, true))
        }
        Err(e) => Err(e),
    }
}
