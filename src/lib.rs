//! TapeBridge Library
//!
//! A tape drive allocation and bridging daemon: accepts drive jobs from a
//! VDQM-style scheduler, reserves a drive for each session, and bridges
//! block data between the network peer and the tape data path.

pub mod cli;
pub mod config;
pub mod drive;
pub mod engine;
pub mod error;
pub mod frame;
pub mod fsm;
pub mod handler;
pub mod logger;
pub mod session;
pub mod tape;
pub mod vdqm;

// Re-export key types for easier use
pub use config::{Config, DriveConfig};
pub use drive::{
    AllocationCollaborator, DriveCollaborator, DriveCriteria, DriveHandle, DriveRegistry,
};
pub use engine::{
    AllocationState, BridgeOutcome, BridgeProtocolEngine, BridgeState,
    DriveAllocationProtocolEngine,
};
pub use error::{Result, TapeBridgeError};
pub use frame::{BlockRecord, FrameHeader, Packer, Unpacker};
pub use fsm::{StateMachine, Transition};
pub use handler::{Daemon, VdqmRequestHandler};
pub use session::{AllocationSession, BridgeSession, Direction, TransferCounters};
