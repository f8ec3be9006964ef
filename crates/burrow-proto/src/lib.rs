//! Tunnel protocol: logical frames and their textual wire codec

pub mod codec;
pub mod frame;
pub mod headers;

pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use frame::{CloseKind, ErrorKind, Frame};
pub use headers::{is_hop_by_hop, HOP_BY_HOP_HEADERS};
