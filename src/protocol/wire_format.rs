//! Wire format encoding and decoding.
//!
//! Implements the 16-byte header format:
//! ```text
//! ┌─────────┬───────┬────────┬──────────────┬──────────┐
//! │ Magic   │ Flags │ Status │ Request ID   │ Length   │
//! │ 2 bytes │ 1 byte│ 1 byte │ 8 bytes      │ 4 bytes  │
//! │ 0xdabb  │       │        │ int64 BE     │ int32 BE │
//! └─────────┴───────┴────────┴──────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use std::fmt;

use crate::error::{Result, RpcError};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Magic constant opening every frame.
pub const MAGIC: [u8; 2] = [0xda, 0xbb];

/// Default maximum payload size (8 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Absolute maximum payload size (max i32).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = i32::MAX as u32;

/// Flag constants for the protocol.
pub mod flags {
    /// Direction: request (1) or response (0).
    pub const REQUEST: u8 = 0b1000_0000;
    /// Two-way request: the peer is expected to answer.
    pub const TWO_WAY: u8 = 0b0100_0000;
    /// Event frame (heartbeat).
    pub const EVENT: u8 = 0b0010_0000;
    /// Low five bits carry the serialization content-type id.
    pub const CONTENT_TYPE_MASK: u8 = 0b0001_1111;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Build a flag byte from its parts.
    #[inline]
    pub fn compose(content_type_id: u8, request: bool, two_way: bool, event: bool) -> u8 {
        let mut flags = content_type_id & CONTENT_TYPE_MASK;
        if request {
            flags |= REQUEST;
        }
        if two_way {
            flags |= TWO_WAY;
        }
        if event {
            flags |= EVENT;
        }
        flags
    }
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    ClientTimeout,
    ServerTimeout,
    BadRequest,
    BadResponse,
    ServiceNotFound,
    ServiceError,
    ServerError,
    ClientError,
    /// Any status byte this client does not know.
    Unknown(u8),
}

impl Status {
    /// True for both timeout statuses.
    pub fn is_timeout(self) -> bool {
        matches!(self, Status::ClientTimeout | Status::ServerTimeout)
    }
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            20 => Status::Ok,
            30 => Status::ClientTimeout,
            31 => Status::ServerTimeout,
            40 => Status::BadRequest,
            50 => Status::BadResponse,
            60 => Status::ServiceNotFound,
            70 => Status::ServiceError,
            80 => Status::ServerError,
            90 => Status::ClientError,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => 20,
            Status::ClientTimeout => 30,
            Status::ServerTimeout => 31,
            Status::BadRequest => 40,
            Status::BadResponse => 50,
            Status::ServiceNotFound => 60,
            Status::ServiceError => 70,
            Status::ServerError => 80,
            Status::ClientError => 90,
            Status::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::ClientTimeout => "CLIENT_TIMEOUT",
            Status::ServerTimeout => "SERVER_TIMEOUT",
            Status::BadRequest => "BAD_REQUEST",
            Status::BadResponse => "BAD_RESPONSE",
            Status::ServiceNotFound => "SERVICE_NOT_FOUND",
            Status::ServiceError => "SERVICE_ERROR",
            Status::ServerError => "SERVER_ERROR",
            Status::ClientError => "CLIENT_ERROR",
            Status::Unknown(code) => return write!(f, "UNKNOWN({})", code),
        };
        write!(f, "{}({})", name, u8::from(*self))
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Raw status byte (meaningful on responses only).
    pub status: u8,
    /// Correlation id tying a response to its request.
    pub request_id: i64,
    /// Payload length in bytes.
    pub payload_length: i32,
}

impl Header {
    /// Create a new header.
    pub fn new(flags: u8, status: u8, request_id: i64, payload_length: i32) -> Self {
        Self {
            flags,
            status,
            request_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use dubbo_client::protocol::{flags, Header, MAGIC};
    ///
    /// let header = Header::new(flags::REQUEST | flags::TWO_WAY | 2, 0, 7, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 16);
    /// assert_eq!(&bytes[..2], &MAGIC);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.flags;
        buf[3] = self.status;
        buf[4..12].copy_from_slice(&self.request_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. The magic bytes are not
    /// checked here, see [`Header::has_magic`].
    ///
    /// # Example
    ///
    /// ```
    /// use dubbo_client::protocol::Header;
    ///
    /// let bytes = [0xda, 0xbb, 0xc2, 0, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.request_id, 7);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[4..12]);
        Some(Self {
            flags: buf[2],
            status: buf[3],
            request_id: i64::from_be_bytes(id),
            payload_length: i32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Check whether a buffer starts with the magic constant.
    #[inline]
    pub fn has_magic(buf: &[u8]) -> bool {
        buf.len() >= 2 && buf[..2] == MAGIC
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Payload length is not negative
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length < 0 {
            return Err(RpcError::Protocol(format!(
                "Negative payload length {}",
                self.payload_length
            )));
        }

        if self.payload_length as u32 > max_payload_size {
            return Err(RpcError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Check if this is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        flags::has_flag(self.flags, flags::REQUEST)
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// Check if the request expects an answer.
    #[inline]
    pub fn is_two_way(&self) -> bool {
        flags::has_flag(self.flags, flags::TWO_WAY)
    }

    /// Check if this is an event (heartbeat) frame.
    #[inline]
    pub fn is_event(&self) -> bool {
        flags::has_flag(self.flags, flags::EVENT)
    }

    /// Serialization content-type id.
    #[inline]
    pub fn content_type_id(&self) -> u8 {
        self.flags & flags::CONTENT_TYPE_MASK
    }

    /// Typed status.
    #[inline]
    pub fn status(&self) -> Status {
        Status::from(self.status)
    }
}

/// Encode a header from its fields (standalone function).
#[inline]
pub fn encode_header(flags: u8, status: u8, request_id: i64, payload_length: i32) -> [u8; HEADER_SIZE] {
    Header::new(flags, status, request_id, payload_length).encode()
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Option<Header> {
    Header::decode(buf)
}
