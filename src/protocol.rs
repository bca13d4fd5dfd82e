//! JSON frames exchanged over the duplex channel
//!
//! Every frame is a JSON object tagged by `type`. Audio payloads travel as
//! base64 strings. Inbound frames that fail to parse are never dropped; they
//! come back as [`InboundFrame::Raw`] so the caller still sees them.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Message id assumed for audio frames that carry none
pub const DEFAULT_MESSAGE_ID: &str = "default";

/// Codec assumed for audio frames that carry no `format`
pub const DEFAULT_AUDIO_FORMAT: &str = "webm";

/// Frame sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// User text
    Text { data: String },
    /// One finished utterance
    Audio {
        format: String,
        size: usize,
        data: String,
    },
    /// Liveness probe stamped with epoch milliseconds
    Ping { timestamp: i64 },
}

impl OutboundFrame {
    /// Build a text frame
    #[must_use]
    pub fn text(data: impl Into<String>) -> Self {
        Self::Text { data: data.into() }
    }

    /// Build an audio frame, base64-encoding the payload
    #[must_use]
    pub fn audio(format: impl Into<String>, payload: &[u8]) -> Self {
        Self::Audio {
            format: format.into(),
            size: payload.len(),
            data: BASE64.encode(payload),
        }
    }

    /// Build a ping frame
    #[must_use]
    pub const fn ping(timestamp: i64) -> Self {
        Self::Ping { timestamp }
    }

    /// Frame kind as it appears in the `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::Ping { .. } => "ping",
        }
    }

    /// Serialize to the wire representation
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One fragment of a streamed audio reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Reply this chunk belongs to
    pub message_id: String,
    /// Position within the reply; arrival order is not guaranteed
    ///
    /// Servers that stream in order omit it. Such chunks play in arrival
    /// order.
    pub sequence: Option<u32>,
    /// Decoded codec bytes
    pub payload: Vec<u8>,
    /// Codec tag (`mp3`, `wav`, `webm`, ...)
    pub format: String,
    /// Marks the last chunk the server will send for this reply
    pub is_final: bool,
}

/// Frame received from the server, classified by its `type` tag
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Assistant text
    Text(String),
    /// Audio chunk of a streamed reply
    Audio(AudioChunk),
    /// Heartbeat answer
    Pong,
    /// Well-formed JSON with a tag this client does not know
    Unknown {
        kind: String,
        payload: serde_json::Value,
    },
    /// Anything that failed to parse, passed through untouched
    Raw(String),
}

#[derive(Debug, Deserialize)]
struct WireText {
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireAudio {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    chunk_id: Option<u32>,
    #[serde(default)]
    is_end: Option<bool>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    data: String,
}

/// Classify one inbound text frame
///
/// Malformed frames degrade to [`InboundFrame::Raw`] instead of failing.
#[must_use]
pub fn parse_inbound(raw: &str) -> InboundFrame {
    match decode_inbound(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, len = raw.len(), "unparseable frame, passing through as raw");
            InboundFrame::Raw(raw.to_string())
        }
    }
}

/// Strict variant of [`parse_inbound`]
///
/// # Errors
///
/// Returns [`Error::Protocol`] when the frame is not JSON, has no `type`
/// tag, or a known frame type is missing required fields
pub fn decode_inbound(raw: &str) -> Result<InboundFrame> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| Error::Protocol(format!("not json: {e}")))?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::Protocol("missing type tag".to_string()))?
        .to_string();

    match kind.as_str() {
        "text" => {
            let text: WireText = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("bad text frame: {e}")))?;
            Ok(InboundFrame::Text(text.data))
        }
        "audio" => {
            let audio: WireAudio = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("bad audio frame: {e}")))?;
            decode_audio(audio).map(InboundFrame::Audio)
        }
        "pong" => Ok(InboundFrame::Pong),
        _ => Ok(InboundFrame::Unknown {
            kind,
            payload: value,
        }),
    }
}

fn decode_audio(audio: WireAudio) -> Result<AudioChunk> {
    let payload = BASE64
        .decode(audio.data.as_bytes())
        .map_err(|e| Error::Protocol(format!("bad audio payload: {e}")))?;

    if let Some(declared) = audio.size {
        if declared != payload.len() as u64 {
            tracing::debug!(
                declared,
                actual = payload.len(),
                "audio frame size does not match payload"
            );
        }
    }

    Ok(AudioChunk {
        message_id: audio
            .message_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_MESSAGE_ID.to_string()),
        sequence: audio.chunk_id,
        payload,
        format: audio
            .format
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_AUDIO_FORMAT.to_string()),
        is_final: audio.is_end.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_audio_carries_size_and_base64() {
        let frame = OutboundFrame::audio("wav", b"RIFF");
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "audio");
        assert_eq!(json["format"], "wav");
        assert_eq!(json["size"], 4);
        assert_eq!(json["data"], "UklGRg==");
    }

    #[test]
    fn outbound_ping_is_stamped() {
        let json = OutboundFrame::ping(1_700_000_000_000).to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping","timestamp":1700000000000}"#);
    }

    #[test]
    fn inbound_audio_chunk() {
        let raw = r#"{"type":"audio","message_id":"m1","chunk_id":3,"is_end":true,"format":"mp3","size":3,"data":"AQID"}"#;
        let InboundFrame::Audio(chunk) = parse_inbound(raw) else {
            panic!("expected audio frame");
        };

        assert_eq!(chunk.message_id, "m1");
        assert_eq!(chunk.sequence, Some(3));
        assert!(chunk.is_final);
        assert_eq!(chunk.format, "mp3");
        assert_eq!(chunk.payload, vec![1, 2, 3]);
    }

    #[test]
    fn inbound_audio_defaults() {
        let raw = r#"{"type":"audio","data":""}"#;
        let InboundFrame::Audio(chunk) = parse_inbound(raw) else {
            panic!("expected audio frame");
        };

        assert_eq!(chunk.message_id, DEFAULT_MESSAGE_ID);
        assert_eq!(chunk.sequence, None);
        assert!(!chunk.is_final);
        assert_eq!(chunk.format, DEFAULT_AUDIO_FORMAT);
    }

    #[test]
    fn inbound_text_and_pong() {
        assert_eq!(
            parse_inbound(r#"{"type":"text","data":"hi"}"#),
            InboundFrame::Text("hi".to_string())
        );
        assert_eq!(parse_inbound(r#"{"type":"pong"}"#), InboundFrame::Pong);
    }

    #[test]
    fn unknown_type_is_kept_as_opaque() {
        let frame = parse_inbound(r#"{"type":"emotion","value":"happy"}"#);
        let InboundFrame::Unknown { kind, payload } = frame else {
            panic!("expected unknown frame");
        };
        assert_eq!(kind, "emotion");
        assert_eq!(payload["value"], "happy");
    }

    #[test]
    fn malformed_frames_become_raw() {
        for raw in [
            "not json at all",
            r#"{"no_type":1}"#,
            r#"{"type":"audio","message_id":"m1"}"#,
            r#"{"type":"audio","data":"***"}"#,
            r#"{"type":"text","data":42}"#,
        ] {
            assert_eq!(parse_inbound(raw), InboundFrame::Raw(raw.to_string()), "{raw}");
        }
    }
}
