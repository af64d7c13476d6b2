//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use dubbo_client::protocol::{flags, Frame, Header};
//! use bytes::Bytes;
//!
//! let header = Header::new(flags::compose(2, false, false, false), 20, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.request_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, Status, HEADER_SIZE};
use crate::error::{Result, RpcError};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the correlation id.
    #[inline]
    pub fn request_id(&self) -> i64 {
        self.header.request_id
    }

    /// Get the response status.
    #[inline]
    pub fn status(&self) -> Status {
        self.header.status()
    }

    /// Check if this is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Check if this is an event (heartbeat) frame.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.header.is_event()
    }
}

/// Build a complete frame as a single byte vector.
///
/// The header's length field is derived from `payload`, so the
/// length invariant holds by construction.
///
/// # Example
///
/// ```
/// use dubbo_client::protocol::build_frame;
///
/// let bytes = build_frame(0xc2, 0, 7, b"hello").unwrap();
/// assert_eq!(bytes.len(), 16 + 5);
/// ```
pub fn build_frame(flags: u8, status: u8, request_id: i64, payload: &[u8]) -> Result<Vec<u8>> {
    let length = i32::try_from(payload.len()).map_err(|_| {
        RpcError::Protocol(format!(
            "Payload of {} bytes does not fit the length field",
            payload.len()
        ))
    })?;
    let header = Header::new(flags, status, request_id, length);

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    #[test]
    fn test_frame_creation() {
        let header = Header::new(flags::compose(2, false, false, false), 20, 42, 5);
        let frame = Frame::new(header, Bytes::from_static(b"hello"));

        assert_eq!(frame.request_id(), 42);
        assert_eq!(frame.status(), Status::Ok);
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.payload_len(), 5);
        assert!(frame.is_response());
        assert!(!frame.is_event());
    }

    #[test]
    fn test_frame_empty_payload() {
        let frame = Frame::new(Header::new(0, 20, 1, 0), Bytes::new());
        assert_eq!(frame.payload_len(), 0);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_heartbeat_frame_accessors() {
        let header = Header::new(flags::compose(2, true, true, true), 0, 3, 0);
        let frame = Frame::new(header, Bytes::new());
        assert!(frame.is_request());
        assert!(frame.is_event());
    }

    #[test]
    fn test_build_frame() {
        let bytes = build_frame(0xc2, 0, 42, b"hello").unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);

        let parsed = Header::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(parsed.payload_length, 5);
        assert_eq!(parsed.request_id, 42);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_frame_empty_payload() {
        let bytes = build_frame(0, 20, 1, b"").unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let bytes = build_frame(0xc2, 0, 456, b"0123456789").unwrap();

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_id(), 456);
        assert_eq!(frames[0].payload(), b"0123456789");
        assert!(frames[0].is_request());
    }
}
