//! Audio output capability and the cpal-backed speaker

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use serde::Serialize;

use crate::PlaybackError;

/// Length of the unlock probe
const PROBE_DURATION: Duration = Duration::from_millis(20);

/// Whether the runtime currently lets output run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputContextState {
    /// Output may start without a user gesture
    Running,
    /// The runtime suspended output until resumed
    Suspended,
    /// No inspectable output context
    Unavailable,
}

/// Decodes and plays binary audio payloads
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Decode `payload` and play it to completion
    ///
    /// Dropping the returned future stops the sound.
    ///
    /// # Errors
    ///
    /// Returns [`PlaybackError`] on decode or device failure
    async fn play(&self, payload: &[u8], format: &str) -> Result<(), PlaybackError>;

    /// Current state of the output context
    fn context_state(&self) -> OutputContextState;

    /// Ask the runtime to resume a suspended context
    async fn resume_context(&self) -> bool;

    /// Play a near-silent sound; true if it started
    async fn play_probe(&self) -> bool;
}

/// Default output device driven through cpal
///
/// Desktop output needs no unlock, so the context reports `Running` whenever
/// an output device exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalOutput;

impl CpalOutput {
    /// Create the output
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn play_samples(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), PlaybackError> {
        if samples.is_empty() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(Arc::clone(&stop));

        tokio::task::spawn_blocking(move || play_samples_blocking(samples, sample_rate, &stop))
            .await
            .map_err(|e| PlaybackError::Output(e.to_string()))?
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn play(&self, payload: &[u8], format: &str) -> Result<(), PlaybackError> {
        let (samples, sample_rate) = decode(payload, format)?;
        self.play_samples(samples, sample_rate).await
    }

    fn context_state(&self) -> OutputContextState {
        if cpal::default_host().default_output_device().is_some() {
            OutputContextState::Running
        } else {
            OutputContextState::Unavailable
        }
    }

    async fn resume_context(&self) -> bool {
        self.context_state() == OutputContextState::Running
    }

    async fn play_probe(&self) -> bool {
        let rate = 16_000;
        #[allow(clippy::cast_possible_truncation)]
        let len = (PROBE_DURATION.as_millis() as usize) * rate as usize / 1000;
        self.play_samples(vec![0.0; len], rate).await.is_ok()
    }
}

/// Flips the flag when the owning future is dropped
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig, PlaybackError> {
    let wanted = SampleRate(sample_rate);
    let exact = device
        .supported_output_configs()
        .map_err(|e| PlaybackError::Output(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
        .min_by_key(cpal::SupportedStreamConfigRange::channels);

    if let Some(range) = exact {
        return Ok(range.with_sample_rate(wanted).config());
    }

    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| PlaybackError::Output(e.to_string()))
}

/// Play mono samples, returning when done or when `stop` is raised
fn play_samples_blocking(
    samples: Vec<f32>,
    sample_rate: u32,
    stop: &AtomicBool,
) -> Result<(), PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::Output("no output device".to_string()))?;

    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels).max(1);
    let samples = Arc::new(resample(&samples, sample_rate, config.sample_rate.0)?);
    let sample_count = samples.len();

    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let cb_samples = Arc::clone(&samples);
    let cb_position = Arc::clone(&position);
    let cb_finished = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let pos = cb_position.load(Ordering::Relaxed);
                    let sample = cb_samples.get(pos).copied().unwrap_or_else(|| {
                        cb_finished.store(true, Ordering::Release);
                        0.0
                    });

                    for out in frame.iter_mut() {
                        *out = sample;
                    }

                    if pos < cb_samples.len() {
                        cb_position.store(pos + 1, Ordering::Relaxed);
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| PlaybackError::Output(e.to_string()))?;

    stream.play().map_err(|e| PlaybackError::Output(e.to_string()))?;

    // Poll for completion with timeout
    let duration_ms = (sample_count as u64 * 1000) / u64::from(config.sample_rate.0.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = std::time::Instant::now();

    while !finished.load(Ordering::Acquire) {
        if stop.load(Ordering::Acquire) {
            tracing::debug!(played = position.load(Ordering::Relaxed), "playback stopped early");
            return Ok(());
        }
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    drop(stream);
    tracing::trace!(samples = sample_count, "chunk playback complete");
    Ok(())
}

/// Decode a payload into mono f32 samples and its sample rate
///
/// # Errors
///
/// Returns [`PlaybackError::Decode`] for corrupt payloads and formats
/// without a decoder
pub fn decode(payload: &[u8], format: &str) -> Result<(Vec<f32>, u32), PlaybackError> {
    match format.to_ascii_lowercase().as_str() {
        "mp3" | "mpeg" => decode_mp3(payload),
        "wav" | "wave" => decode_wav(payload),
        other => Err(PlaybackError::Decode(format!("no decoder for {other}"))),
    }
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32), PlaybackError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                let channels = frame.channels.max(1);
                samples.extend(frame.data.chunks(channels).map(|c| {
                    c.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>() / channel_scale(c.len())
                }));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(PlaybackError::Decode(format!("mp3: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(PlaybackError::Decode("mp3: no frames".to_string()));
    }
    Ok((samples, sample_rate))
}

/// Decode WAV bytes to mono f32 samples
#[allow(clippy::cast_precision_loss)]
fn decode_wav(wav_data: &[u8]) -> Result<(Vec<f32>, u32), PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(wav_data))
        .map_err(|e| PlaybackError::Decode(format!("wav: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels).max(1);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PlaybackError::Decode(format!("wav: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| PlaybackError::Decode(format!("wav: {e}")))?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / channel_scale(c.len()))
        .collect();
    Ok((mono, spec.sample_rate))
}

#[allow(clippy::cast_precision_loss)]
fn channel_scale(n: usize) -> f32 {
    n as f32
}

/// Frames fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Resample mono audio using rubato
///
/// The tail is zero-padded and the filter delay trimmed, so the output holds
/// exactly `samples.len() * to / from` samples (rounded).
///
/// # Errors
///
/// Returns [`PlaybackError::Decode`] if either rate is unusable
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, PlaybackError> {
    use rubato::{FftFixedIn, Resampler};

    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f64>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
            .map_err(|e| PlaybackError::Decode(format!("resampler init failed: {e}")))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * f64::from(to) / f64::from(from)).round() as usize;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(delay + expected + RESAMPLE_CHUNK);
    let mut offset = 0;

    while output.len() < delay + expected {
        let mut chunk = vec![0.0; RESAMPLE_CHUNK];
        if offset < input.len() {
            let end = (offset + RESAMPLE_CHUNK).min(input.len());
            chunk[..end - offset].copy_from_slice(&input[offset..end]);
        }
        offset += RESAMPLE_CHUNK;

        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| PlaybackError::Decode(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output[delay..delay + expected]
        .iter()
        .map(|&s| s as f32)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::samples_to_wav;

    #[test]
    fn wav_round_trips_through_decoder() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5, 0.25], 22_050).unwrap();
        let (samples, rate) = decode(&wav, "wav").unwrap();

        assert_eq!(rate, 22_050);
        assert_eq!(samples.len(), 4);
        assert!((samples[1] - 0.5).abs() < 0.001);
    }

    #[test]
    fn unknown_format_is_a_decode_error() {
        assert!(matches!(decode(b"xxxx", "webm"), Err(PlaybackError::Decode(_))));
        assert!(matches!(decode(b"xxxx", "wav"), Err(PlaybackError::Decode(_))));
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let input = vec![0.0; 480];
        assert_eq!(resample(&input, 48_000, 16_000).unwrap().len(), 160);
        assert_eq!(resample(&input, 16_000, 48_000).unwrap().len(), 1440);
        assert_eq!(resample(&input, 24_000, 24_000).unwrap().len(), 480);
        assert_eq!(resample(&input, 44_100, 48_000).unwrap().len(), 522);
    }

    #[test]
    fn zero_rate_is_a_decode_error() {
        assert!(matches!(resample(&[0.1; 16], 0, 48_000), Err(PlaybackError::Decode(_))));
    }
}
