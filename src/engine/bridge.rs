//! Bridge protocol engine.
//!
//! Owns an allocated drive for the data-transfer half of a session and
//! drives it to a terminal state:
//!
//! `Idle -> Mounting -> Transferring -> Unmounting -> Done | Aborted`
//!
//! Any collaborator or peer failure, a data-integrity violation, or an
//! external abort signal lands in `Aborted`. Both terminal states hand the
//! drive back to the allocation authority exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::drive::{AllocationCollaborator, DriveCollaborator};
use crate::error::{Result, TapeBridgeError};
use crate::frame::{Packer, Unpacker};
use crate::fsm::{StateMachine, Transition};
use crate::session::{BridgeSession, Direction, TransferCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeState {
    Idle,
    Mounting,
    Transferring,
    Unmounting,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BridgeEvent {
    Start,
    Mounted,
    EndOfData,
    Unmounted,
    Abort,
}

/// What the caller observes at session end: the terminal state, the final
/// counters, and the error detail behind an abort. Session-fatal errors
/// never escape the engine any other way.
#[derive(Debug)]
pub struct BridgeOutcome {
    pub state: BridgeState,
    pub counters: TransferCounters,
    pub error: Option<TapeBridgeError>,
}

pub struct BridgeProtocolEngine {
    session: BridgeSession,
    fsm: StateMachine<BridgeState, BridgeEvent, BridgeSession>,
    drive_io: Arc<dyn DriveCollaborator>,
    authority: Arc<dyn AllocationCollaborator>,
    mount_timeout: Duration,
    abort_rx: watch::Receiver<bool>,
    released: bool,
}

impl BridgeProtocolEngine {
    pub fn new(
        session: BridgeSession,
        drive_io: Arc<dyn DriveCollaborator>,
        authority: Arc<dyn AllocationCollaborator>,
        abort_rx: watch::Receiver<bool>,
        mount_timeout: Duration,
    ) -> Result<Self> {
        let fsm = Self::transition_table()?;
        Ok(Self {
            session,
            fsm,
            drive_io,
            authority,
            mount_timeout,
            abort_rx,
            released: false,
        })
    }

    fn transition_table() -> Result<StateMachine<BridgeState, BridgeEvent, BridgeSession>> {
        use BridgeEvent::*;
        use BridgeState::*;

        let mut fsm = StateMachine::new(Idle);
        fsm.register(
            Transition {
                from: Idle,
                to: Mounting,
                event: Start,
            },
            Some(Box::new(|session: &mut BridgeSession| {
                info!(
                    session = %session.id,
                    unit = %session.drive.unit,
                    direction = ?session.direction,
                    "mounting drive"
                );
                Ok(())
            })),
        )?;
        fsm.register(
            Transition {
                from: Mounting,
                to: Transferring,
                event: Mounted,
            },
            Some(Box::new(|session: &mut BridgeSession| {
                debug!(session = %session.id, "mount confirmed, transferring");
                Ok(())
            })),
        )?;
        fsm.register(
            Transition {
                from: Transferring,
                to: Unmounting,
                event: EndOfData,
            },
            Some(Box::new(|session: &mut BridgeSession| {
                debug!(
                    session = %session.id,
                    blocks = session.counters.blocks,
                    "end of data, unmounting"
                );
                Ok(())
            })),
        )?;
        fsm.register(
            Transition {
                from: Unmounting,
                to: Done,
                event: Unmounted,
            },
            Some(Box::new(|session: &mut BridgeSession| {
                info!(
                    session = %session.id,
                    unit = %session.drive.unit,
                    blocks = session.counters.blocks,
                    bytes = session.counters.bytes,
                    "session done"
                );
                Ok(())
            })),
        )?;
        for from in [Mounting, Transferring, Unmounting] {
            fsm.register(
                Transition {
                    from,
                    to: Aborted,
                    event: Abort,
                },
                Some(Box::new(|session: &mut BridgeSession| {
                    warn!(
                        session = %session.id,
                        unit = %session.drive.unit,
                        blocks = session.counters.blocks,
                        "session aborted"
                    );
                    Ok(())
                })),
            )?;
        }
        Ok(fsm)
    }

    pub fn state(&self) -> BridgeState {
        self.fsm.current()
    }

    /// Drive the session over the peer connection to a terminal state.
    ///
    /// The drive is released on every exit path; a second release attempt
    /// is a no-op.
    pub async fn run<P>(mut self, peer: P) -> BridgeOutcome
    where
        P: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let error = match self.drive_session(peer).await {
            Ok(()) => None,
            Err(error) => {
                if let Err(fire_error) = self.fsm.fire(BridgeEvent::Abort, &mut self.session) {
                    warn!(
                        session = %self.session.id,
                        error = %fire_error,
                        "abort transition not taken"
                    );
                }
                Some(error)
            }
        };
        self.release().await;
        BridgeOutcome {
            state: self.fsm.current(),
            counters: self.session.counters,
            error,
        }
    }

    async fn drive_session<P>(&mut self, peer: P) -> Result<()>
    where
        P: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.fsm.fire(BridgeEvent::Start, &mut self.session)?;

        let drive = self.session.drive.clone();
        let drive_io = Arc::clone(&self.drive_io);
        let mount_timeout = self.mount_timeout;
        tokio::select! {
            biased;
            _ = wait_abort(&mut self.abort_rx) => {
                return Err(abort_error());
            }
            mounted = tokio::time::timeout(mount_timeout, drive_io.mount(&drive)) => {
                mounted.map_err(|_| {
                    TapeBridgeError::timeout(format!(
                        "mount of {} not confirmed within {:?}",
                        drive.unit, mount_timeout
                    ))
                })??;
            }
        }
        self.fsm.fire(BridgeEvent::Mounted, &mut self.session)?;

        match self.session.direction {
            Direction::Write => self.transfer_inbound(peer).await?,
            Direction::Read => self.transfer_outbound(peer).await?,
        }
        self.fsm.fire(BridgeEvent::EndOfData, &mut self.session)?;

        tokio::select! {
            biased;
            _ = wait_abort(&mut self.abort_rx) => {
                return Err(abort_error());
            }
            unmounted = tokio::time::timeout(mount_timeout, drive_io.unmount(&drive)) => {
                unmounted.map_err(|_| {
                    TapeBridgeError::timeout(format!(
                        "unmount of {} not confirmed within {:?}",
                        drive.unit, mount_timeout
                    ))
                })??;
            }
        }
        self.fsm.fire(BridgeEvent::Unmounted, &mut self.session)?;
        Ok(())
    }

    /// Write path: unpack block frames from the peer and write them to
    /// tape, one block in flight at a time.
    async fn transfer_inbound<R>(&mut self, peer: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let drive = self.session.drive.clone();
        let drive_io = Arc::clone(&self.drive_io);
        let mut unpacker = Unpacker::new(peer);

        loop {
            let block = tokio::select! {
                biased;
                _ = wait_abort(&mut self.abort_rx) => return Err(abort_error()),
                block = unpacker.next_block() => block?,
            };
            match block {
                Some(record) => {
                    // The tape write itself can stall; keep it abortable too.
                    tokio::select! {
                        biased;
                        _ = wait_abort(&mut self.abort_rx) => return Err(abort_error()),
                        written = drive_io.write_block(&drive, &record) => written?,
                    }
                    self.session.counters.record_block(record.payload.len());
                }
                None => return Ok(()),
            }
        }
    }

    /// Read path: read blocks from tape and pack them toward the peer,
    /// closing the stream with the end-of-data marker.
    async fn transfer_outbound<W>(&mut self, peer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let drive = self.session.drive.clone();
        let drive_io = Arc::clone(&self.drive_io);
        let mut packer = Packer::new(peer);

        loop {
            let block = tokio::select! {
                biased;
                _ = wait_abort(&mut self.abort_rx) => return Err(abort_error()),
                block = drive_io.read_block(&drive) => block?,
            };
            match block {
                Some(record) => {
                    // The packer enforces the strictly-increasing sequence
                    // contract against what the drive hands us. A peer that
                    // stops draining its socket must not pin the drive, so
                    // the send is raced against the abort signal as well.
                    tokio::select! {
                        biased;
                        _ = wait_abort(&mut self.abort_rx) => return Err(abort_error()),
                        packed = packer.pack(&record) => packed?,
                    }
                    self.session.counters.record_block(record.payload.len());
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = wait_abort(&mut self.abort_rx) => return Err(abort_error()),
                        finished = packer.finish() => finished?,
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(error) = self.authority.release_drive(&self.session.drive).await {
            warn!(
                session = %self.session.id,
                unit = %self.session.drive.unit,
                error = %error,
                "drive release failed"
            );
        }
    }
}

fn abort_error() -> TapeBridgeError {
    TapeBridgeError::peer("session aborted by external signal")
}

/// Resolves once the abort flag is raised. If the abort handle is gone,
/// nobody can signal anymore and this never resolves.
async fn wait_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
