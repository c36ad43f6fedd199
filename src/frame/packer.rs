//! Streaming packer: block records in, wire frames out.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Result, TapeBridgeError};
use crate::frame::{BlockRecord, FrameHeader, FIRST_SEQUENCE, MAX_BLOCK_SIZE};

/// Packs a session's block records into the wire framing, one frame at a
/// time. Holds no more than the frame currently being written.
///
/// A packer is single-use: once `finish` has emitted the end-of-data
/// marker, the stream can only be restarted with a fresh session.
pub struct Packer<W> {
    writer: W,
    next_sequence: u64,
}

impl<W: AsyncWrite + Unpin> Packer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_sequence: FIRST_SEQUENCE,
        }
    }

    /// Encode and write one block record.
    ///
    /// The record's sequence number must be exactly the next one for this
    /// session; a gap or duplicate is a protocol error on our own side and
    /// aborts the session rather than corrupting the stream.
    pub async fn pack(&mut self, record: &BlockRecord) -> Result<()> {
        if record.sequence != self.next_sequence {
            return Err(TapeBridgeError::Sequence {
                expected: self.next_sequence,
                got: record.sequence,
            });
        }
        if record.payload.len() > MAX_BLOCK_SIZE as usize {
            return Err(TapeBridgeError::protocol(format!(
                "block {} payload of {} bytes exceeds maximum of {}",
                record.sequence,
                record.payload.len(),
                MAX_BLOCK_SIZE
            )));
        }

        let header = FrameHeader::for_block(record);
        self.writer.write_all(&header.to_bytes()).await?;
        self.writer.write_all(&record.payload).await?;
        trace!(
            sequence = record.sequence,
            bytes = record.payload.len(),
            "packed block frame"
        );

        self.next_sequence += 1;
        Ok(())
    }

    /// Emit the end-of-data marker and flush the underlying writer.
    pub async fn finish(mut self) -> Result<()> {
        let header = FrameHeader::end_of_data(self.next_sequence);
        self.writer.write_all(&header.to_bytes()).await?;
        self.writer.flush().await?;
        trace!(sequence = self.next_sequence, "packed end-of-data frame");
        Ok(())
    }

    /// Sequence number the next packed block must carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}
