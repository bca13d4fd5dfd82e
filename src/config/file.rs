//! TOML configuration file loading
//!
//! Supports `~/.config/voxlink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoxlinkConfigFile {
    /// Remote service endpoint
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Liveness probing
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,

    /// Microphone and segmentation
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Reply playback and autoplay unlock
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Client identity persistence
    #[serde(default)]
    pub identity: IdentityFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// WebSocket endpoint (e.g. "wss://example.com/ws")
    pub url: Option<String>,
}

/// Heartbeat configuration
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatFileConfig {
    pub enabled: Option<bool>,
    pub interval_ms: Option<u64>,
    pub stale_after_ms: Option<u64>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Codec tag of outbound utterances
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub bits_per_second: Option<u32>,
    pub enable_vad: Option<bool>,
    /// Pause between a voice-driven stop and the automatic send
    pub settle_delay_ms: Option<u64>,
    pub positive_threshold: Option<f32>,
    pub negative_threshold: Option<f32>,
    pub redemption_frames: Option<u32>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub autoplay: Option<bool>,
    pub unlock_interval_ms: Option<u64>,
    pub blocked_wait_ms: Option<u64>,
    pub chunk_gap_ms: Option<u64>,
    pub interrupted_memory: Option<usize>,
    /// Mobile-class runtime where output needs an explicit unlock
    pub restricted: Option<bool>,
}

/// Identity configuration
#[derive(Debug, Default, Deserialize)]
pub struct IdentityFileConfig {
    pub store_path: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoxlinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoxlinkConfigFile {
    config_file_path().map_or_else(VoxlinkConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Same fallback rules as [`load_config_file`].
pub fn load_config_file_from(path: &Path) -> VoxlinkConfigFile {
    if !path.exists() {
        return VoxlinkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoxlinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoxlinkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voxlink/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxlink").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let fc: VoxlinkConfigFile = toml::from_str(
            r#"
            [server]
            url = "wss://voice.example.com/ws"

            [playback]
            restricted = true
            "#,
        )
        .unwrap();

        assert_eq!(fc.server.url.as_deref(), Some("wss://voice.example.com/ws"));
        assert_eq!(fc.playback.restricted, Some(true));
        assert!(fc.heartbeat.interval_ms.is_none());
        assert!(fc.capture.enable_vad.is_none());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nurl = ").unwrap();

        let fc = load_config_file_from(&path);
        assert!(fc.server.url.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let fc = load_config_file_from(Path::new("/nonexistent/voxlink/config.toml"));
        assert!(fc.server.url.is_none());
    }
}
