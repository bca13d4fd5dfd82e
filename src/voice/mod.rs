//! Voice pipelines
//!
//! Capture turns microphone input into utterances, segmented by voice
//! activity. Playback reassembles streamed replies and plays them in order
//! once the runtime allows output.

mod capture;
mod device;
mod playback;
mod scheduler;
mod unlock;
mod vad;

pub use capture::{
    RecordingSession, RecordingTrigger, Utterance, VadOutcome, VoiceCapture,
    acquire_with_fallback,
};
pub use device::{
    CaptureConstraints, CpalMicrophone, CpalMicrophoneProvider, Microphone, MicrophoneProvider,
    SampleTap, samples_to_wav,
};
pub use playback::{AudioOutput, CpalOutput, OutputContextState, decode, resample};
pub use scheduler::{
    Admission, AudioMessage, DEFAULT_INTERRUPTED_MEMORY, Directive, Interrupted, PlaybackScheduler,
};
pub use unlock::{Recheck, UnlockNegotiator, UnlockStrategy, run_strategies};
pub use vad::{
    EnergyVad, EnergyVadProvider, POLL_INTERVAL, SpeechSegmenter, VadProvider, VadSignal, VadSink,
    VadThresholds, VoiceActivityDetector, speech_score,
};
