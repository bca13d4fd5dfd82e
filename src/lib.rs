//! Voxlink - real-time duplex voice client
//!
//! Keeps one duplex channel to a voice service alive, records utterances
//! segmented by voice activity, and plays streamed audio replies back in
//! order without gaps or overlaps once the runtime allows output.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                VoiceClient (handle)                   │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ commands / events
//! ┌──────────────────────────▼───────────────────────────┐
//! │                  client actor task                    │
//! │  Connection │ Heartbeat │ VoiceCapture │ Scheduler   │
//! │                               UnlockNegotiator       │
//! └──────┬──────────────┬──────────────┬─────────────────┘
//!        │              │              │
//!    Transport    Microphone/VAD   AudioOutput
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod voice;

pub use client::{ClientEvent, Collaborators, StatusSnapshot, VoiceClient};
pub use config::Config;
pub use connection::{ConnectionState, Transport, WebSocketTransport};
pub use error::{DeviceError, Error, PlaybackError, Result};
pub use identity::{FileStore, KeyValueStore, MemoryStore};
pub use protocol::{AudioChunk, InboundFrame, OutboundFrame};
