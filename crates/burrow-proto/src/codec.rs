//! Codec for encoding/decoding frames on the text transport

use crate::frame::Frame;
use thiserror::Error;

/// Default maximum encoded frame size (16 MiB, including base64 overhead)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Wire tags the codec recognizes
const KNOWN_TYPES: &[&str] = &[
    "attach", "ack", "error", "request", "response", "ping", "pong", "close",
];

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("missing field in '{type_tag}' frame: {detail}")]
    FieldMissing { type_tag: String, detail: String },

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Frame codec with a configurable size cap.
///
/// Oversized traffic in either direction is a session-fatal error; callers
/// tear the transport down on [`CodecError::FrameTooLarge`].
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a frame to its JSON text form
    pub fn encode(&self, frame: &Frame) -> Result<String, CodecError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

        if text.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_bytes,
            });
        }

        Ok(text)
    }

    /// Decode a frame from its JSON text form.
    ///
    /// Classifies failures: unparseable envelope, unrecognized `type` tag,
    /// or a recognized tag with required fields absent or unreadable.
    pub fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        if text.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_bytes,
            });
        }

        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

        if !value.is_object() {
            return Err(CodecError::MalformedFrame(
                "frame is not a JSON object".to_string(),
            ));
        }

        let type_tag = match value.get("type").and_then(|t| t.as_str()) {
            Some(tag) => tag.to_string(),
            None => {
                return Err(CodecError::FieldMissing {
                    type_tag: "<none>".to_string(),
                    detail: "'type' tag absent or not a string".to_string(),
                })
            }
        };

        if !KNOWN_TYPES.contains(&type_tag.as_str()) {
            return Err(CodecError::UnknownType(type_tag));
        }

        serde_json::from_value(value).map_err(|e| CodecError::FieldMissing {
            type_tag,
            detail: e.to_string(),
        })
    }
}
