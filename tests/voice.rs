//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use voxlink::voice::{
    SpeechSegmenter, VadSignal, VadThresholds, decode, resample, samples_to_wav, speech_score,
};

const SAMPLE_RATE: u32 = 16_000;

/// Samples in one 100 ms detector frame
const FRAME: usize = (SAMPLE_RATE / 10) as usize;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Feed `samples` frame by frame and collect the signals
fn segment(segmenter: &mut SpeechSegmenter, samples: &[f32]) -> Vec<VadSignal> {
    samples
        .chunks(FRAME)
        .filter_map(|frame| segmenter.process(frame))
        .collect()
}

#[test]
fn test_speech_score_separates_tone_from_silence() {
    let tone = generate_sine_samples(220.0, 0.1, 0.3);
    let silence = generate_silence(0.1);

    assert!(speech_score(&tone) > 0.9);
    assert!(speech_score(&silence) < 0.01);
}

#[test]
fn test_utterance_between_silences_is_one_segment() {
    let mut segmenter = SpeechSegmenter::new(VadThresholds::default());

    let mut audio = generate_silence(0.5);
    audio.extend(generate_sine_samples(220.0, 1.5, 0.3));
    audio.extend(generate_silence(1.5));

    assert_eq!(
        segment(&mut segmenter, &audio),
        vec![VadSignal::SpeechStart, VadSignal::SpeechEnd]
    );
}

#[test]
fn test_short_pause_does_not_split_utterance() {
    let mut segmenter = SpeechSegmenter::new(VadThresholds::default());

    let mut audio = generate_sine_samples(220.0, 0.5, 0.3);
    // Shorter than the redemption window
    audio.extend(generate_silence(0.3));
    audio.extend(generate_sine_samples(220.0, 0.5, 0.3));

    assert_eq!(segment(&mut segmenter, &audio), vec![VadSignal::SpeechStart]);
    assert!(segmenter.is_speaking());
}

#[test]
fn test_quiet_tone_stays_below_threshold() {
    let mut segmenter = SpeechSegmenter::new(VadThresholds::default());
    let whisper = generate_sine_samples(220.0, 1.0, 0.01);

    assert!(segment(&mut segmenter, &whisper).is_empty());
}

#[test]
fn test_recorded_wav_decodes_for_playback() {
    let samples = generate_sine_samples(440.0, 0.25, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");

    let (decoded, rate) = decode(&wav, "wav").unwrap();
    assert_eq!(rate, SAMPLE_RATE);
    assert_eq!(decoded.len(), samples.len());

    let max_err = samples
        .iter()
        .zip(&decoded)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_err < 0.001, "max error {max_err}");
}

#[test]
fn test_resample_to_device_rate() {
    let samples = generate_sine_samples(440.0, 0.5, 0.5);
    let upsampled = resample(&samples, SAMPLE_RATE, 48_000).unwrap();

    assert_eq!(upsampled.len(), samples.len() * 3);
    // Band-limited filter: allow a little ringing over the input peak
    assert!(upsampled.iter().all(|s| s.abs() <= 0.55));

    // Delay is trimmed: the tone is still in phase with the input
    let peak = upsampled.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    assert!(peak > 0.45, "peak {peak}");
    let err = (upsampled[3000] - samples[1000]).abs();
    assert!(err < 0.1, "phase error {err}");
}
