//! Streaming unpacker: wire frames in, block records out.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::{Result, TapeBridgeError};
use crate::frame::{payload_checksum, BlockRecord, FrameHeader, FIRST_SEQUENCE};

/// Unpacks a session's wire stream back into block records, validating the
/// checksum and sequence number of every frame. Buffers at most one frame.
pub struct Unpacker<R> {
    reader: R,
    next_sequence: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> Unpacker<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            next_sequence: FIRST_SEQUENCE,
            finished: false,
        }
    }

    /// Read and validate the next frame.
    ///
    /// Returns `Ok(None)` once the end-of-data marker has been consumed.
    /// A checksum mismatch rejects the frame without advancing the
    /// sequence cursor; the session is expected to abort.
    pub async fn next_block(&mut self) -> Result<Option<BlockRecord>> {
        if self.finished {
            return Ok(None);
        }

        let mut header_buf = [0u8; FrameHeader::SIZE_BYTES];
        self.reader.read_exact(&mut header_buf).await?;
        let header = FrameHeader::from_bytes(&header_buf)?;

        let mut payload = vec![0u8; header.length as usize];
        self.reader.read_exact(&mut payload).await?;

        let computed = payload_checksum(&payload);
        if computed != header.checksum {
            return Err(TapeBridgeError::Checksum {
                sequence: header.sequence,
                stored: header.checksum,
                computed,
            });
        }

        if header.sequence != self.next_sequence {
            return Err(TapeBridgeError::Sequence {
                expected: self.next_sequence,
                got: header.sequence,
            });
        }

        if header.is_end_of_data() {
            trace!(sequence = header.sequence, "unpacked end-of-data frame");
            self.finished = true;
            return Ok(None);
        }

        trace!(
            sequence = header.sequence,
            bytes = payload.len(),
            "unpacked block frame"
        );
        self.next_sequence += 1;
        Ok(Some(BlockRecord {
            sequence: header.sequence,
            payload,
        }))
    }

    /// Sequence number the next valid frame must carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}
