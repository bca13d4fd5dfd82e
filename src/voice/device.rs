//! Microphone capability and the cpal-backed input device

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{DeviceError, Error, Result};

/// Seconds of audio the VAD tap keeps when nobody drains it
const TAP_SECONDS: usize = 2;

/// Requested properties of the input stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Exact sample rate, or whatever the device prefers
    pub sample_rate: Option<u32>,
    /// Exact channel count, or whatever the device prefers
    pub channels: Option<u16>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Mono speech capture at `sample_rate` with processing enabled
    #[must_use]
    pub const fn preferred(sample_rate: u32) -> Self {
        Self {
            sample_rate: Some(sample_rate),
            channels: Some(1),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    /// No requirements at all: take the device default
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            sample_rate: None,
            channels: None,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }

    /// Whether these are the fallback constraints
    #[must_use]
    pub const fn is_minimal(&self) -> bool {
        self.sample_rate.is_none() && self.channels.is_none()
    }
}

/// Live mono sample feed shared between the input callback and the VAD
///
/// Holds at most a couple of seconds; older samples are dropped.
#[derive(Debug, Clone)]
pub struct SampleTap {
    buffer: Arc<Mutex<VecDeque<f32>>>,
    sample_rate: u32,
}

impl SampleTap {
    /// Create an empty tap
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            sample_rate,
        }
    }

    /// Sample rate of the fed samples
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append samples, discarding the oldest beyond capacity
    pub fn push(&self, samples: &[f32]) {
        let capacity = self.sample_rate as usize * TAP_SECONDS;
        if let Ok(mut buf) = self.buffer.lock() {
            buf.extend(samples.iter().copied());
            let excess = buf.len().saturating_sub(capacity);
            buf.drain(..excess);
        }
    }

    /// Take everything buffered so far
    #[must_use]
    pub fn take(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| buf.drain(..).collect())
            .unwrap_or_default()
    }
}

/// An acquired, exclusively held audio input
///
/// The handle stays open across recordings; [`Microphone::release`] gives the
/// device back.
pub trait Microphone: Send {
    /// Codec tag of payloads produced by the recorder
    fn format(&self) -> &str;

    /// Sample feed for voice-activity detection
    fn tap(&self) -> SampleTap;

    /// Begin accumulating an utterance
    ///
    /// # Errors
    ///
    /// Returns error if the recorder cannot start
    fn start_recorder(&mut self) -> Result<()>;

    /// Stop accumulating and return the encoded utterance
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    fn stop_recorder(&mut self) -> Result<Vec<u8>>;

    /// Close the device
    fn release(&mut self);
}

/// Acquires microphones
#[async_trait]
pub trait MicrophoneProvider: Send + Sync {
    /// Open the input device under `constraints`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] with the failure kind
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn Microphone>>;
}

/// Microphone provider for the default cpal input device
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalMicrophoneProvider;

impl CpalMicrophoneProvider {
    /// Create the provider
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MicrophoneProvider for CpalMicrophoneProvider {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn Microphone>> {
        let constraints = constraints.clone();
        let mic = tokio::task::spawn_blocking(move || CpalMicrophone::open(&constraints))
            .await
            .map_err(|e| DeviceError::Unavailable(e.to_string()))??;
        Ok(Box::new(mic))
    }
}

/// Default input device captured through cpal
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread that
/// holds it until the stop sender is dropped.
pub struct CpalMicrophone {
    sample_rate: u32,
    tap: SampleTap,
    recording: Arc<AtomicBool>,
    recorded: Arc<Mutex<Vec<f32>>>,
    stop: Option<mpsc::Sender<()>>,
}

impl CpalMicrophone {
    /// Open the default input device and start streaming
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] describing why the device could not be opened
    pub fn open(constraints: &CaptureConstraints) -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(DeviceError::DeviceNotFound)?;
        let config = select_input_config(&device, constraints)?;
        let sample_rate = config.sample_rate.0;
        let channels = usize::from(config.channels).max(1);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            minimal = constraints.is_minimal(),
            "audio capture initialized"
        );

        let tap = SampleTap::new(sample_rate);
        let recording = Arc::new(AtomicBool::new(false));
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), DeviceError>>();

        let cb_tap = tap.clone();
        let cb_recording = Arc::clone(&recording);
        let cb_recorded = Arc::clone(&recorded);

        std::thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono = downmix(data, channels);
                        cb_tap.push(&mono);
                        if cb_recording.load(Ordering::Acquire) {
                            if let Ok(mut buf) = cb_recorded.lock() {
                                buf.extend_from_slice(&mono);
                            }
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(map_build_error(e)));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(map_play_error(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Blocks until the sender is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| DeviceError::Unavailable("capture thread exited".to_string()))??;

        Ok(Self {
            sample_rate,
            tap,
            recording,
            recorded,
            stop: Some(stop_tx),
        })
    }
}

impl Microphone for CpalMicrophone {
    fn format(&self) -> &str {
        "wav"
    }

    fn tap(&self) -> SampleTap {
        self.tap.clone()
    }

    fn start_recorder(&mut self) -> Result<()> {
        if self.stop.is_none() {
            return Err(DeviceError::Unavailable("microphone released".to_string()).into());
        }
        if let Ok(mut buf) = self.recorded.lock() {
            buf.clear();
        }
        self.recording.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_recorder(&mut self) -> Result<Vec<u8>> {
        self.recording.store(false, Ordering::Release);
        let samples = self
            .recorded
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();
        samples_to_wav(&samples, self.sample_rate)
    }

    fn release(&mut self) {
        self.recording.store(false, Ordering::Release);
        // Dropping the sender ends the capture thread
        self.stop = None;
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.release();
    }
}

fn select_input_config(
    device: &cpal::Device,
    constraints: &CaptureConstraints,
) -> Result<StreamConfig> {
    let Some(rate) = constraints.sample_rate else {
        let config = device
            .default_input_config()
            .map_err(|e| match e {
                cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceError::DeviceNotFound,
                cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                    DeviceError::ConstraintsUnsupported("no input stream type".to_string())
                }
                cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                    classify_backend(&err.description)
                }
            })?;
        return Ok(config.config());
    };

    let wanted_channels = constraints.channels.unwrap_or(1);
    let supported = device
        .supported_input_configs()
        .map_err(|e| match e {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => DeviceError::DeviceNotFound,
            cpal::SupportedStreamConfigsError::InvalidArgument => {
                DeviceError::Unavailable("invalid device query".to_string())
            }
            cpal::SupportedStreamConfigsError::BackendSpecific { err } => {
                classify_backend(&err.description)
            }
        })?
        .find(|c| {
            c.channels() == wanted_channels
                && c.min_sample_rate() <= SampleRate(rate)
                && c.max_sample_rate() >= SampleRate(rate)
        })
        .ok_or_else(|| {
            DeviceError::ConstraintsUnsupported(format!("{rate} Hz with {wanted_channels} channel(s)"))
        })?;

    Ok(supported.with_sample_rate(SampleRate(rate)).config())
}

fn map_build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::DeviceNotFound,
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => {
            DeviceError::ConstraintsUnsupported(e.to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend(&err.description),
        cpal::BuildStreamError::StreamIdOverflow => DeviceError::Unavailable(e.to_string()),
    }
}

fn map_play_error(e: cpal::PlayStreamError) -> DeviceError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => DeviceError::DeviceNotFound,
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend(&err.description),
    }
}

/// Best-effort mapping of backend messages onto actionable kinds
fn classify_backend(description: &str) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        DeviceError::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        DeviceError::DeviceBusy
    } else if lower.contains("no such device") || lower.contains("not found") {
        DeviceError::DeviceNotFound
    } else {
        DeviceError::Unavailable(description.to_string())
    }
}

#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Convert f32 samples to mono 16-bit WAV bytes
///
/// # Errors
///
/// Returns [`Error::Codec`] if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Codec(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Codec(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Codec(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_keeps_only_recent_samples() {
        let tap = SampleTap::new(4);
        tap.push(&[0.1; 6]);
        tap.push(&[0.9; 4]);

        let samples = tap.take();
        assert_eq!(samples.len(), 8);
        assert!((samples[7] - 0.9).abs() < f32::EPSILON);
        assert!(tap.take().is_empty());
    }

    #[test]
    fn downmix_averages_interleaved_frames() {
        assert_eq!(downmix(&[0.2, 0.4, -1.0, 1.0], 2), vec![0.3, 0.0]);
        assert_eq!(downmix(&[0.5, 0.25], 1), vec![0.5, 0.25]);
    }

    #[test]
    fn backend_messages_are_classified() {
        assert_eq!(classify_backend("Permission denied"), DeviceError::PermissionDenied);
        assert_eq!(classify_backend("Device or resource busy"), DeviceError::DeviceBusy);
        assert!(matches!(classify_backend("boom"), DeviceError::Unavailable(_)));
    }

    #[test]
    fn minimal_constraints_are_detected() {
        assert!(CaptureConstraints::minimal().is_minimal());
        assert!(!CaptureConstraints::preferred(48_000).is_minimal());
    }

    #[test]
    fn wav_encoding_writes_riff_header() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], 16_000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        // 44-byte header plus three 16-bit samples
        assert_eq!(wav.len(), 44 + 6);
    }
}
