//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 16 bytes starting with the magic
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! Bytes that do not start with the magic constant are dropped according
//! to the buffer's [`ResyncPolicy`].
//!
//! # Example
//!
//! ```
//! use dubbo_client::protocol::{build_frame, FrameBuffer};
//!
//! let bytes = build_frame(0x02, 20, 9, b"payload").unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..10]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[10..]).unwrap();
//! assert_eq!(frames[0].request_id(), 9);
//! ```

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC};
use super::Frame;
use crate::error::Result;

/// What to drop when buffered bytes do not start with the magic constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncPolicy {
    /// Drop everything buffered and resume with the next bytes that arrive.
    /// Never recovers if a frame boundary falls inside a dropped chunk.
    DiscardChunk,
    /// Drop bytes up to the next occurrence of the magic constant.
    #[default]
    #[serde(alias = "scan")]
    ScanForMagic,
}

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 16 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header, remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
    /// Resynchronization policy on bad magic.
    resync: ResyncPolicy,
    /// Total bytes dropped while resynchronizing.
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 8MB, scan-for-magic resync.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PAYLOAD_SIZE, ResyncPolicy::default())
    }

    /// Create a new frame buffer with custom max payload size and resync policy.
    pub fn with_config(max_payload_size: u32, resync: ResyncPolicy) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
            resync,
            discarded: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames. If data is fragmented,
    /// partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a header carries a negative or oversized payload length.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on protocol violation
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                if !self.align_to_magic() {
                    return Ok(None);
                }
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = match Header::decode(&self.buffer[..HEADER_SIZE]) {
                    Some(header) => header,
                    None => return Ok(None),
                };
                header.validate(self.max_payload_size)?;

                self.buffer.advance(HEADER_SIZE);

                if header.payload_length == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new())));
                }

                self.state = State::WaitingForPayload {
                    header,
                    remaining: header.payload_length as usize,
                };

                self.try_extract_one()
            }

            State::WaitingForPayload { header, remaining } => {
                let remaining = *remaining;

                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let header = *header;

                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, payload)))
            }
        }
    }

    /// Drop leading bytes until the buffer starts with the magic constant.
    ///
    /// Returns true when the buffer is aligned and holds at least the magic.
    fn align_to_magic(&mut self) -> bool {
        if self.buffer.len() < MAGIC.len() {
            return false;
        }
        if Header::has_magic(&self.buffer) {
            return true;
        }

        let skip = match self.resync {
            ResyncPolicy::DiscardChunk => self.buffer.len(),
            ResyncPolicy::ScanForMagic => find_magic(&self.buffer[1..])
                .map(|pos| pos + 1)
                .unwrap_or_else(|| {
                    // Keep a trailing first magic byte, its partner may be next.
                    if self.buffer[self.buffer.len() - 1] == MAGIC[0] {
                        self.buffer.len() - 1
                    } else {
                        self.buffer.len()
                    }
                }),
        };

        tracing::warn!(
            discarded = skip,
            policy = ?self.resync,
            "bad magic in inbound stream, discarding bytes"
        );
        self.buffer.advance(skip);
        self.discarded += skip as u64;

        Header::has_magic(&self.buffer)
    }

    /// Total bytes discarded while resynchronizing.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if a frame is partially buffered.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForPayload { .. })
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack.windows(MAGIC.len()).position(|w| w == MAGIC)
}
