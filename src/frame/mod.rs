//! Block record wire framing.
//!
//! Tape payload data crosses the bridge as a stream of frames:
//!
//! `[sequence: u64][length: u32][checksum: u32][payload: length bytes]`
//!
//! All fields are network byte order. Sequence numbers start at 1 and
//! increase by exactly one per frame within a session. End-of-data is a
//! zero-length frame carrying the next sequence number and the checksum of
//! the empty payload.

mod packer;
mod unpacker;

pub use packer::Packer;
pub use unpacker::Unpacker;

use std::hash::Hasher;

use twox_hash::XxHash32;

use crate::error::{Result, TapeBridgeError};

/// First valid block sequence number in a session.
pub const FIRST_SEQUENCE: u64 = 1;

/// Upper bound on a single block payload (16 MiB).
///
/// Bounds memory allocation when reading frames from an untrusted peer.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Checksum over a frame payload (XXH32, seed 0).
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(payload);
    hasher.finish() as u32
}

/// One unit of tape payload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl BlockRecord {
    pub fn new(sequence: u64, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    pub fn checksum(&self) -> u32 {
        payload_checksum(&self.payload)
    }
}

/// Frame header (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn for_block(record: &BlockRecord) -> Self {
        Self {
            sequence: record.sequence,
            length: record.payload.len() as u32,
            checksum: record.checksum(),
        }
    }

    /// Header for the end-of-data marker closing a session's stream.
    pub fn end_of_data(sequence: u64) -> Self {
        Self {
            sequence,
            length: 0,
            checksum: payload_checksum(&[]),
        }
    }

    pub fn is_end_of_data(&self) -> bool {
        self.length == 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self> {
        let sequence = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let length = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let checksum = u32::from_be_bytes(buf[12..16].try_into().unwrap());

        if length > MAX_BLOCK_SIZE {
            return Err(TapeBridgeError::protocol(format!(
                "frame payload of {} bytes exceeds maximum of {}",
                length, MAX_BLOCK_SIZE
            )));
        }

        Ok(Self {
            sequence,
            length,
            checksum,
        })
    }
}

const _: () = {
    assert!(FrameHeader::SIZE_BYTES == 16);
};
