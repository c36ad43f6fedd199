//! Session records shared by the protocol engines.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::drive::{DriveCriteria, DriveHandle};

/// Direction of one bridge session, fixed at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer to tape (migration).
    Write,
    /// Tape to peer (recall).
    Read,
}

impl Direction {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Write),
            1 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Write => 0,
            Self::Read => 1,
        }
    }
}

/// Cumulative per-session transfer counters, logged at session end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    pub blocks: u64,
    pub bytes: u64,
}

impl TransferCounters {
    pub fn record_block(&mut self, payload_len: usize) {
        self.blocks += 1;
        self.bytes += payload_len as u64;
    }
}

/// One inbound VDQM job from arrival until allocation failure or handoff
/// to a bridge session.
#[derive(Debug, Clone)]
pub struct AllocationSession {
    pub id: Uuid,
    pub criteria: DriveCriteria,
    pub client_user: String,
    pub started_at: DateTime<Utc>,
}

impl AllocationSession {
    pub fn new(criteria: DriveCriteria, client_user: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            criteria,
            client_user,
            started_at: Utc::now(),
        }
    }
}

/// One data-transfer session over an allocated drive, from handoff until
/// drive release.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub id: Uuid,
    pub drive: DriveHandle,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub counters: TransferCounters,
}

impl BridgeSession {
    /// Continue an allocation session over the drive it was granted.
    pub fn from_allocation(
        allocation: &AllocationSession,
        drive: DriveHandle,
        direction: Direction,
    ) -> Self {
        Self {
            id: allocation.id,
            drive,
            direction,
            started_at: Utc::now(),
            counters: TransferCounters::default(),
        }
    }
}
