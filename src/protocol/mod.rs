//! Protocol module - wire format, framing, and messages.
//!
//! This module implements the binary RPC protocol:
//! - 16-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Request/response messages and their payload layout

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, ResyncPolicy};
pub use message::{
    body, decode_frame, encode_request, encode_response, frame_from_bytes, Attachments,
    Invocation, Message, Request, RequestData, Response, PROTOCOL_VERSION,
};
pub use wire_format::{
    decode_header, encode_header, flags, Header, Status, ABSOLUTE_MAX_PAYLOAD_SIZE,
    DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC,
};
