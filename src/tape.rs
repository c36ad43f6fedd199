//! File-backed drive collaborator.
//!
//! Stands in for the physical data path: blocks are persisted to the
//! drive's device path in the same framing used on the wire, so a regular
//! file can play the tape during integration and bench runs. Real SCSI
//! command encoding lives outside this daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::drive::{DriveCollaborator, DriveHandle};
use crate::error::{Result, TapeBridgeError};
use crate::frame::{payload_checksum, BlockRecord, FrameHeader};

#[derive(Default)]
pub struct FileTapeDrive {
    mounted: Mutex<HashMap<String, File>>,
}

impl FileTapeDrive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DriveCollaborator for FileTapeDrive {
    async fn mount(&self, handle: &DriveHandle) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&handle.device)
            .await
            .map_err(|e| {
                TapeBridgeError::drive(format!("cannot open {}: {}", handle.device, e))
            })?;
        debug!(unit = %handle.unit, device = %handle.device, "tape mounted");
        self.mounted.lock().await.insert(handle.unit.clone(), file);
        Ok(())
    }

    async fn unmount(&self, handle: &DriveHandle) -> Result<()> {
        let file = self.mounted.lock().await.remove(&handle.unit);
        match file {
            Some(mut file) => {
                file.flush().await?;
                debug!(unit = %handle.unit, "tape unmounted");
                Ok(())
            }
            None => Err(TapeBridgeError::drive(format!(
                "unmount of {} with no mounted tape",
                handle.unit
            ))),
        }
    }

    async fn read_block(&self, handle: &DriveHandle) -> Result<Option<BlockRecord>> {
        let mut mounted = self.mounted.lock().await;
        let file = mounted.get_mut(&handle.unit).ok_or_else(|| {
            TapeBridgeError::drive(format!("read on {} with no mounted tape", handle.unit))
        })?;

        let mut header_buf = [0u8; FrameHeader::SIZE_BYTES];
        match file.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::from_bytes(&header_buf)?;

        let mut payload = vec![0u8; header.length as usize];
        file.read_exact(&mut payload).await?;
        let computed = payload_checksum(&payload);
        if computed != header.checksum {
            return Err(TapeBridgeError::Checksum {
                sequence: header.sequence,
                stored: header.checksum,
                computed,
            });
        }

        Ok(Some(BlockRecord {
            sequence: header.sequence,
            payload,
        }))
    }

    async fn write_block(&self, handle: &DriveHandle, record: &BlockRecord) -> Result<()> {
        let mut mounted = self.mounted.lock().await;
        let file = mounted.get_mut(&handle.unit).ok_or_else(|| {
            TapeBridgeError::drive(format!("write on {} with no mounted tape", handle.unit))
        })?;

        let header = FrameHeader::for_block(record);
        file.write_all(&header.to_bytes()).await?;
        file.write_all(&record.payload).await?;
        Ok(())
    }
}
