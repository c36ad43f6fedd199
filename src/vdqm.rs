//! VDQM job wire protocol.
//!
//! The drive scheduler submits a job over TCP as a small handshake frame;
//! the daemon answers with an acknowledgement before any session work
//! starts. All integers are network byte order, strings are u16
//! length-prefixed UTF-8.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::drive::DriveCriteria;
use crate::error::{Result, TapeBridgeError};
use crate::session::Direction;

/// "TPBR" in ASCII.
pub const JOB_MAGIC: u32 = 0x5450_4252;
pub const JOB_VERSION: u32 = 1;

/// Longest accepted dgn / unit / user string.
pub const MAX_STRING_LEN: usize = 255;

pub const ACK_OK: u32 = 0;
pub const ACK_ERR_PROTOCOL: u32 = 1;
pub const ACK_ERR_UNKNOWN_DRIVE: u32 = 2;
pub const ACK_ERR_BUSY: u32 = 3;
pub const ACK_ERR_REJECTED: u32 = 4;
pub const ACK_ERR_INTERNAL: u32 = 5;

/// An inbound drive job as submitted by VDQM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub direction: Direction,
    /// Device group name the job targets.
    pub dgn: String,
    /// Specific drive unit, or empty for any unit in the group.
    pub drive_unit: String,
    pub client_user: String,
}

impl JobRequest {
    pub fn criteria(&self) -> DriveCriteria {
        DriveCriteria {
            dgn: self.dgn.clone(),
            unit: if self.drive_unit.is_empty() {
                None
            } else {
                Some(self.drive_unit.clone())
            },
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32().await?;
        if magic != JOB_MAGIC {
            return Err(TapeBridgeError::protocol(format!(
                "bad job magic 0x{:08x}",
                magic
            )));
        }
        let version = reader.read_u32().await?;
        if version != JOB_VERSION {
            return Err(TapeBridgeError::protocol(format!(
                "unsupported job version {}",
                version
            )));
        }
        let direction = Direction::from_wire(reader.read_u8().await?)
            .ok_or_else(|| TapeBridgeError::protocol("bad direction code"))?;
        let dgn = read_string(reader).await?;
        let drive_unit = read_string(reader).await?;
        let client_user = read_string(reader).await?;

        if dgn.is_empty() {
            return Err(TapeBridgeError::protocol("job without device group name"));
        }

        Ok(Self {
            direction,
            dgn,
            drive_unit,
            client_user,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32(JOB_MAGIC).await?;
        writer.write_u32(JOB_VERSION).await?;
        writer.write_u8(self.direction.to_wire()).await?;
        write_string(writer, &self.dgn).await?;
        write_string(writer, &self.drive_unit).await?;
        write_string(writer, &self.client_user).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Acknowledgement returned to VDQM before session work starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAck {
    pub status: u32,
    pub message: String,
}

impl JobAck {
    pub fn ok() -> Self {
        Self {
            status: ACK_OK,
            message: String::new(),
        }
    }

    pub fn error<T: Into<String>>(status: u32, message: T) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ACK_OK
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let status = reader.read_u32().await?;
        let message = read_string(reader).await?;
        Ok(Self { status, message })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32(self.status).await?;
        write_string(writer, &self.message).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await? as usize;
    if len > MAX_STRING_LEN {
        return Err(TapeBridgeError::protocol(format!(
            "string field of {} bytes exceeds maximum of {}",
            len, MAX_STRING_LEN
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| TapeBridgeError::protocol("string field is not UTF-8"))
}

async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> Result<()> {
    if value.len() > MAX_STRING_LEN {
        return Err(TapeBridgeError::protocol(format!(
            "string field of {} bytes exceeds maximum of {}",
            value.len(),
            MAX_STRING_LEN
        )));
    }
    writer.write_u16(value.len() as u16).await?;
    writer.write_all(value.as_bytes()).await?;
    Ok(())
}
