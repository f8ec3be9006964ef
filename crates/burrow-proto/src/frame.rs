//! Protocol frame types

use serde::{Deserialize, Serialize};

/// Control-error kinds reported during the attach handshake or by the agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownId,
    BadToken,
    AlreadyAttached,
    Capacity,
    LocalUnreachable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownId => "unknown_id",
            ErrorKind::BadToken => "bad_token",
            ErrorKind::AlreadyAttached => "already_attached",
            ErrorKind::Capacity => "capacity",
            ErrorKind::LocalUnreachable => "local_unreachable",
        }
    }
}

/// Reasons a session is torn down
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseKind {
    PeerClose,
    HeartbeatTimeout,
    Protocol,
    MalformedFrame,
    FrameTooLarge,
    AdminDelete,
    Shutdown,
}

impl CloseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseKind::PeerClose => "peer_close",
            CloseKind::HeartbeatTimeout => "heartbeat_timeout",
            CloseKind::Protocol => "protocol",
            CloseKind::MalformedFrame => "malformed_frame",
            CloseKind::FrameTooLarge => "frame_too_large",
            CloseKind::AdminDelete => "admin_delete",
            CloseKind::Shutdown => "shutdown",
        }
    }
}

/// One logical message on the tunnel transport.
///
/// The wire form is a JSON object tagged by `type`. Header lists preserve
/// duplicate keys and order; bodies travel base64-encoded in `body_b64` so
/// arbitrary binary survives the text transport. Unknown fields are ignored
/// on decode for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// First frame sent by the agent after dialing the transport
    Attach { auth_token: String },
    /// Server confirmation of a successful attach
    Ack,
    /// Control-level failure (handshake rejection, agent-side errors)
    Error { kind: ErrorKind, message: String },
    /// Proxied HTTP request, server -> agent
    Request {
        id: u64,
        method: String,
        path: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(rename = "body_b64", default, with = "base64_bytes")]
        body: Vec<u8>,
    },
    /// Proxied HTTP response, agent -> server
    Response {
        id: u64,
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(rename = "body_b64", default, with = "base64_bytes")]
        body: Vec<u8>,
    },
    /// Heartbeat probe; `t` is an opaque monotonic tag echoed by the pong
    Ping { t: u64 },
    Pong { t: u64 },
    /// Orderly teardown with a reason
    Close { kind: CloseKind, message: String },
}

impl Frame {
    /// Wire tag for this frame, as it appears in the `type` field
    pub fn type_tag(&self) -> &'static str {
        match self {
            Frame::Attach { .. } => "attach",
            Frame::Ack => "ack",
            Frame::Error { .. } => "error",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Close { .. } => "close",
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_wire_shape() {
        let frame = Frame::Attach {
            auth_token: "secret".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["type"], "attach");
        assert_eq!(json["auth_token"], "secret");
    }

    #[test]
    fn test_request_body_is_base64() {
        let frame = Frame::Request {
            id: 7,
            method: "POST".to_string(),
            path: "/echo".to_string(),
            query: String::new(),
            headers: vec![("content-type".to_string(), "application/octet-stream".to_string())],
            body: vec![0x00, 0xff, 0x10],
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["body_b64"], "AP8Q");
        assert!(json.get("body").is_none());
    }

    #[test]
    fn test_headers_preserve_order_and_duplicates() {
        let frame = Frame::Response {
            id: 1,
            status: 200,
            headers: vec![
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
                ("content-type".to_string(), "text/plain".to_string()),
            ],
            body: b"ok".to_vec(),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let decoded: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_error_kinds_snake_case() {
        let frame = Frame::Error {
            kind: ErrorKind::AlreadyAttached,
            message: "busy".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["kind"], "already_attached");
    }

    #[test]
    fn test_close_kinds_snake_case() {
        let frame = Frame::Close {
            kind: CloseKind::HeartbeatTimeout,
            message: "3 missed heartbeats".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["kind"], "heartbeat_timeout");
    }

    #[test]
    fn test_ping_pong_tags() {
        let ping = Frame::Ping { t: 42 };
        let text = serde_json::to_string(&ping).unwrap();
        let decoded: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, Frame::Ping { t: 42 });
    }
}
