//! Protocol engines driving the two halves of a session: drive
//! allocation against VDQM, then data bridging over the allocated drive.

pub mod allocation;
pub mod bridge;

pub use allocation::{AllocationState, DriveAllocationProtocolEngine};
pub use bridge::{BridgeOutcome, BridgeProtocolEngine, BridgeState};
