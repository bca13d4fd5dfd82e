//! Configuration management for the voxlink client

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::voice::DEFAULT_INTERRUPTED_MEMORY;
use crate::{Error, Result};

/// Default server endpoint
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

/// Voxlink client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote service endpoint
    pub server: ServerConfig,

    /// Liveness probing
    pub heartbeat: HeartbeatConfig,

    /// Microphone and segmentation
    pub capture: CaptureConfig,

    /// Reply playback and autoplay unlock
    pub playback: PlaybackConfig,

    /// Client identity persistence
    pub identity: IdentityConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket endpoint; the client id is appended as `uid`
    pub url: String,
}

/// Heartbeat configuration
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Send pings while connected
    pub enabled: bool,

    /// Time between pings
    pub interval: Duration,

    /// Silence after which the link counts as degraded
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Codec tag put on outbound utterances
    pub format: String,

    /// Preferred capture sample rate
    pub sample_rate: u32,

    /// Target encoder bitrate for compressed formats
    pub bits_per_second: u32,

    /// Initialize voice-activity detection with the microphone
    pub enable_vad: bool,

    /// Pause between a voice-driven stop and the automatic send
    pub settle_delay: Duration,

    /// Score at or above which a frame counts as speech
    pub positive_threshold: f32,

    /// Score below which a frame counts as silence
    pub negative_threshold: f32,

    /// Silent frames tolerated before speech is considered over
    pub redemption_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: "wav".to_string(),
            sample_rate: 48_000,
            bits_per_second: 128_000,
            enable_vad: true,
            settle_delay: Duration::from_millis(100),
            positive_threshold: 0.5,
            negative_threshold: 0.35,
            redemption_frames: 8,
        }
    }
}

/// Playback configuration
#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    /// Schedule inbound audio automatically
    pub autoplay: bool,

    /// Minimum time between unlock attempts
    pub unlock_interval: Duration,

    /// How long a locked message waits before `PlaybackBlocked` is raised
    pub blocked_wait: Duration,

    /// Silence inserted between consecutive chunks
    pub chunk_gap: Duration,

    /// Interrupted message ids remembered so their late chunks are dropped
    pub interrupted_memory: usize,

    /// Mobile-class runtime: the desktop fallback unlock is not allowed
    pub restricted: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            autoplay: true,
            unlock_interval: Duration::from_millis(1000),
            blocked_wait: Duration::from_millis(200),
            chunk_gap: Duration::ZERO,
            interrupted_memory: DEFAULT_INTERRUPTED_MEMORY,
            restricted: false,
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// JSON file holding the persisted client id
    pub store_path: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            store_path: data_dir().join("identity.json"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: DEFAULT_SERVER_URL.to_string(),
            },
            heartbeat: HeartbeatConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config file (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting values are invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] for an unparseable endpoint and [`Error::Config`]
    /// for out-of-range values
    pub fn from_sources<F>(fc: file::VoxlinkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env_bool = |key: &str| env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let env_u64 = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());

        // Server (env > toml > default)
        let url = env("VOXLINK_URL")
            .or(fc.server.url)
            .unwrap_or(defaults.server.url);
        let scheme = Url::parse(&url)?.scheme().to_string();
        if !matches!(scheme.as_str(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "server url must use ws or wss, got {scheme}"
            )));
        }

        // Heartbeat
        let heartbeat = HeartbeatConfig {
            enabled: env_bool("VOXLINK_HEARTBEAT")
                .or(fc.heartbeat.enabled)
                .unwrap_or(defaults.heartbeat.enabled),
            interval: env_u64("VOXLINK_HEARTBEAT_INTERVAL_MS")
                .or(fc.heartbeat.interval_ms)
                .map_or(defaults.heartbeat.interval, Duration::from_millis),
            stale_after: fc
                .heartbeat
                .stale_after_ms
                .map_or(defaults.heartbeat.stale_after, Duration::from_millis),
        };
        if heartbeat.interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".to_string()));
        }

        // Capture
        let dc = defaults.capture;
        let capture = CaptureConfig {
            format: fc.capture.format.unwrap_or(dc.format),
            sample_rate: fc.capture.sample_rate.unwrap_or(dc.sample_rate),
            bits_per_second: fc.capture.bits_per_second.unwrap_or(dc.bits_per_second),
            enable_vad: env_bool("VOXLINK_ENABLE_VAD")
                .or(fc.capture.enable_vad)
                .unwrap_or(dc.enable_vad),
            settle_delay: fc
                .capture
                .settle_delay_ms
                .map_or(dc.settle_delay, Duration::from_millis),
            positive_threshold: fc.capture.positive_threshold.unwrap_or(dc.positive_threshold),
            negative_threshold: fc.capture.negative_threshold.unwrap_or(dc.negative_threshold),
            redemption_frames: fc.capture.redemption_frames.unwrap_or(dc.redemption_frames),
        };
        if !(0.0..=1.0).contains(&capture.positive_threshold)
            || capture.negative_threshold < 0.0
            || capture.negative_threshold > capture.positive_threshold
        {
            return Err(Error::Config(format!(
                "vad thresholds must satisfy 0 <= negative ({}) <= positive ({}) <= 1",
                capture.negative_threshold, capture.positive_threshold
            )));
        }

        // Playback
        let dp = defaults.playback;
        let playback = PlaybackConfig {
            autoplay: fc.playback.autoplay.unwrap_or(dp.autoplay),
            unlock_interval: fc
                .playback
                .unlock_interval_ms
                .map_or(dp.unlock_interval, Duration::from_millis),
            blocked_wait: fc
                .playback
                .blocked_wait_ms
                .map_or(dp.blocked_wait, Duration::from_millis),
            chunk_gap: fc
                .playback
                .chunk_gap_ms
                .map_or(dp.chunk_gap, Duration::from_millis),
            interrupted_memory: fc
                .playback
                .interrupted_memory
                .unwrap_or(dp.interrupted_memory),
            restricted: env_bool("VOXLINK_RESTRICTED")
                .or(fc.playback.restricted)
                .unwrap_or(dp.restricted),
        };

        let identity = IdentityConfig {
            store_path: fc
                .identity
                .store_path
                .map_or(defaults.identity.store_path, PathBuf::from),
        };

        Ok(Self {
            server: ServerConfig { url },
            heartbeat,
            capture,
            playback,
            identity,
        })
    }
}

/// Data directory (`~/.local/share/voxlink` on Linux)
#[must_use]
pub fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("voxlink"))
}
