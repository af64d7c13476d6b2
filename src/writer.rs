//! Frame writes over a connection's write half.
//!
//! A frame goes out as two slices (header and payload) through
//! `write_vectored`, so the common case is a single syscall. Partial
//! writes resume from the exact byte offset where the kernel stopped.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::protocol::HEADER_SIZE;

/// A frame ready to be written to a socket.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded header (16 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for null heartbeats).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Split an already-encoded frame into header and payload.
    ///
    /// Returns `None` if `bytes` is shorter than a header.
    pub fn from_encoded(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let payload = Bytes::from(bytes).slice(HEADER_SIZE..);
        Some(Self { header, payload })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Write one frame with scatter/gather I/O and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &OutboundFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size = frame.size();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(frame, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(frame: &OutboundFrame, skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(2);

    if skip_bytes < HEADER_SIZE {
        slices.push(IoSlice::new(&frame.header[skip_bytes..]));
    }

    if !frame.payload.is_empty() {
        let start_in_payload = skip_bytes.saturating_sub(HEADER_SIZE);
        if start_in_payload < frame.payload.len() {
            slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
        }
    }

    slices
}
