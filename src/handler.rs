//! Inbound VDQM job handling and the daemon accept loop.
//!
//! The handler is boundary glue: it parses one connection's job handshake,
//! answers with an acknowledgement, and moves all further work onto a
//! dedicated session task so the accepting loop is never blocked past
//! request parsing. A bounded semaphore makes pool exhaustion explicit.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::drive::{AllocationCollaborator, DriveCollaborator, DriveRegistry};
use crate::engine::{BridgeProtocolEngine, DriveAllocationProtocolEngine};
use crate::error::{Result, TapeBridgeError};
use crate::session::{AllocationSession, BridgeSession};
use crate::vdqm::{
    JobAck, JobRequest, ACK_ERR_BUSY, ACK_ERR_INTERNAL, ACK_ERR_PROTOCOL, ACK_ERR_REJECTED,
    ACK_ERR_UNKNOWN_DRIVE,
};

#[derive(Clone)]
pub struct VdqmRequestHandler {
    config: Arc<Config>,
    registry: Arc<DriveRegistry>,
    drive_io: Arc<dyn DriveCollaborator>,
    abort_rx: watch::Receiver<bool>,
    sessions: Arc<Semaphore>,
}

impl VdqmRequestHandler {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<DriveRegistry>,
        drive_io: Arc<dyn DriveCollaborator>,
        abort_rx: watch::Receiver<bool>,
    ) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            config,
            registry,
            drive_io,
            abort_rx,
            sessions,
        }
    }

    /// Entry point invoked once per accepted connection.
    ///
    /// Parses the job handshake under a deadline and acknowledges it. On
    /// parse failure the connection gets a protocol-error ack and no
    /// session is started. On success the session runs on its own task and
    /// this returns immediately.
    pub async fn handle<C>(&self, mut conn: C) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let request = match tokio::time::timeout(
            self.config.handshake_timeout(),
            JobRequest::read_from(&mut conn),
        )
        .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(error)) => {
                let _ = JobAck::error(ACK_ERR_PROTOCOL, error.to_string())
                    .write_to(&mut conn)
                    .await;
                return Err(error);
            }
            Err(_elapsed) => {
                let error = TapeBridgeError::timeout("job handshake did not arrive in time");
                let _ = JobAck::error(ACK_ERR_PROTOCOL, error.to_string())
                    .write_to(&mut conn)
                    .await;
                return Err(error);
            }
        };

        // A job naming a drive unit this daemon does not manage is refused
        // up front, before any allocation attempt.
        if !request.drive_unit.is_empty() && !self.registry.manages_unit(&request.drive_unit) {
            let error = TapeBridgeError::protocol(format!(
                "drive unit {} is not managed by this daemon",
                request.drive_unit
            ));
            let _ = JobAck::error(ACK_ERR_UNKNOWN_DRIVE, error.to_string())
                .write_to(&mut conn)
                .await;
            return Err(error);
        }

        let permit = match Arc::clone(&self.sessions).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                let error = TapeBridgeError::rejected("session pool exhausted");
                let _ = JobAck::error(ACK_ERR_BUSY, error.to_string())
                    .write_to(&mut conn)
                    .await;
                return Err(error);
            }
            Err(TryAcquireError::Closed) => {
                return Err(TapeBridgeError::protocol("session pool closed"));
            }
        };

        JobAck::ok().write_to(&mut conn).await?;
        debug!(
            dgn = %request.dgn,
            unit = %request.drive_unit,
            user = %request.client_user,
            "job accepted"
        );

        let handler = self.clone();
        tokio::spawn(async move {
            handler.run_session(request, conn).await;
            drop(permit);
        });
        Ok(())
    }

    /// Session-scoped work: allocate a drive, report the outcome to the
    /// requester, then bridge data over this connection until a terminal
    /// state.
    async fn run_session<C>(&self, request: JobRequest, mut conn: C)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let allocation = AllocationSession::new(request.criteria(), request.client_user.clone());
        let session_id = allocation.id;

        let mut engine = match DriveAllocationProtocolEngine::new(
            allocation,
            Arc::clone(&self.registry) as Arc<dyn AllocationCollaborator>,
            self.config.allocation_timeout(),
        ) {
            Ok(engine) => engine,
            Err(error) => {
                error!(session = %session_id, error = %error, "allocation engine setup failed");
                return;
            }
        };

        let drive = match engine.allocate().await {
            Ok(drive) => drive,
            Err(error) => {
                let status = match &error {
                    TapeBridgeError::Rejected(_) => ACK_ERR_REJECTED,
                    _ => ACK_ERR_INTERNAL,
                };
                let _ = JobAck::error(status, error.to_string())
                    .write_to(&mut conn)
                    .await;
                info!(
                    session = %session_id,
                    state = ?engine.state(),
                    error = %error,
                    "allocation session ended without a drive"
                );
                return;
            }
        };

        if let Err(error) = JobAck::ok().write_to(&mut conn).await {
            // The requester went away between allocation and transfer; give
            // the drive straight back.
            warn!(session = %session_id, error = %error, "peer lost after allocation");
            self.registry.release(&drive.unit);
            return;
        }

        let drive_unit = drive.unit.clone();
        let session = BridgeSession::from_allocation(engine.session(), drive, request.direction);
        let bridge = match BridgeProtocolEngine::new(
            session,
            Arc::clone(&self.drive_io),
            Arc::clone(&self.registry) as Arc<dyn AllocationCollaborator>,
            self.abort_rx.clone(),
            self.config.mount_timeout(),
        ) {
            Ok(bridge) => bridge,
            Err(error) => {
                error!(session = %session_id, error = %error, "bridge engine setup failed");
                self.registry.release(&drive_unit);
                return;
            }
        };

        let outcome = bridge.run(conn).await;
        match outcome.error {
            None => info!(
                session = %session_id,
                blocks = outcome.counters.blocks,
                bytes = outcome.counters.bytes,
                "bridge session finished"
            ),
            Some(error) => warn!(
                session = %session_id,
                state = ?outcome.state,
                error = %error,
                "bridge session aborted"
            ),
        }
    }
}

/// The daemon: a request handler plus the accept loop and the shutdown
/// signal fanned out to running sessions.
pub struct Daemon {
    handler: Arc<VdqmRequestHandler>,
    abort_tx: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(config: Config, drive_io: Arc<dyn DriveCollaborator>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(DriveRegistry::new(config.drives.clone()));
        let (abort_tx, abort_rx) = watch::channel(false);
        let handler = Arc::new(VdqmRequestHandler::new(
            Arc::new(config),
            registry,
            drive_io,
            abort_rx,
        ));
        Ok(Self { handler, abort_tx })
    }

    pub fn handler(&self) -> Arc<VdqmRequestHandler> {
        Arc::clone(&self.handler)
    }

    /// Abort all running sessions. Safe to call from any task.
    pub fn shutdown(&self) {
        let _ = self.abort_tx.send(true);
    }

    /// Accept job connections until the listener fails.
    pub async fn listen(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "accepting VDQM job connections");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!(peer = %peer_addr, "job connection accepted");
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(error) = handler.handle(stream).await {
                    warn!(peer = %peer_addr, error = %error, "job connection refused");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::drive::DriveHandle;
    use crate::frame::{BlockRecord, Packer};
    use crate::session::Direction;
    use crate::vdqm::ACK_OK;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::duplex;

    #[derive(Default)]
    struct RecordingDrive {
        written: Mutex<Vec<BlockRecord>>,
    }

    #[async_trait]
    impl DriveCollaborator for RecordingDrive {
        async fn mount(&self, _handle: &DriveHandle) -> Result<()> {
            Ok(())
        }

        async fn unmount(&self, _handle: &DriveHandle) -> Result<()> {
            Ok(())
        }

        async fn read_block(&self, _handle: &DriveHandle) -> Result<Option<BlockRecord>> {
            Ok(None)
        }

        async fn write_block(&self, _handle: &DriveHandle, record: &BlockRecord) -> Result<()> {
            self.written.lock().push(record.clone());
            Ok(())
        }
    }

    fn config(units: &[&str]) -> Config {
        Config {
            drives: units
                .iter()
                .map(|unit| DriveConfig {
                    unit: unit.to_string(),
                    dgn: "T10KD6".to_string(),
                    device: format!("/dev/{}", unit),
                })
                .collect(),
            ..Config::default()
        }
    }

    fn job(unit: &str) -> JobRequest {
        JobRequest {
            direction: Direction::Write,
            dgn: "T10KD6".to_string(),
            drive_unit: unit.to_string(),
            client_user: "stage".to_string(),
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn malformed_handshake_gets_protocol_ack_and_no_session() {
        let drive_io = Arc::new(RecordingDrive::default());
        let daemon = Daemon::new(config(&["T0"]), drive_io).unwrap();
        let handler = daemon.handler();

        let (mut client, server) = duplex(4096);
        tokio::io::AsyncWriteExt::write_u32(&mut client, 0xBAD0BAD0)
            .await
            .unwrap();

        let result = handler.handle(server).await;
        assert!(matches!(result, Err(TapeBridgeError::Protocol(_))));

        let ack = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(ack.status, ACK_ERR_PROTOCOL);
    }

    #[tokio::test]
    async fn unmanaged_drive_unit_refused() {
        let drive_io = Arc::new(RecordingDrive::default());
        let daemon = Daemon::new(config(&["T0"]), drive_io).unwrap();
        let handler = daemon.handler();

        let (mut client, server) = duplex(4096);
        job("T9").write_to(&mut client).await.unwrap();

        let result = handler.handle(server).await;
        assert!(result.is_err());

        let ack = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(ack.status, ACK_ERR_UNKNOWN_DRIVE);
    }

    #[tokio::test]
    async fn busy_pool_refused_before_allocation() {
        let drive_io = Arc::new(RecordingDrive::default());
        let mut cfg = config(&["T0", "T1"]);
        cfg.max_sessions = 1;
        let daemon = Daemon::new(cfg, drive_io).unwrap();
        let handler = daemon.handler();

        // First job occupies the only permit; its peer sends no data so the
        // session stays alive.
        let (mut first_client, first_server) = duplex(4096);
        job("T0").write_to(&mut first_client).await.unwrap();
        handler.handle(first_server).await.unwrap();
        let ack = JobAck::read_from(&mut first_client).await.unwrap();
        assert_eq!(ack.status, ACK_OK);

        let (mut second_client, second_server) = duplex(4096);
        job("T1").write_to(&mut second_client).await.unwrap();
        let result = handler.handle(second_server).await;
        assert!(matches!(result, Err(TapeBridgeError::Rejected(_))));

        let ack = JobAck::read_from(&mut second_client).await.unwrap();
        assert_eq!(ack.status, ACK_ERR_BUSY);
    }

    #[tokio::test]
    async fn no_free_drive_reports_rejection() {
        let drive_io = Arc::new(RecordingDrive::default());
        let daemon = Daemon::new(config(&["T0"]), drive_io).unwrap();
        let handler = daemon.handler();

        // Take the only drive out of the pool directly.
        handler
            .registry
            .try_allocate(&job("T0").criteria())
            .unwrap();

        let (mut client, server) = duplex(4096);
        job("T0").write_to(&mut client).await.unwrap();
        handler.handle(server).await.unwrap();

        let accepted = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(accepted.status, ACK_OK);

        let allocation = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(allocation.status, ACK_ERR_REJECTED);
    }

    #[tokio::test]
    async fn full_write_job_lands_blocks_on_tape_and_frees_the_drive() {
        let drive_io = Arc::new(RecordingDrive::default());
        let daemon =
            Daemon::new(config(&["T0"]), Arc::clone(&drive_io) as Arc<dyn DriveCollaborator>)
                .unwrap();
        let handler = daemon.handler();

        let (mut client, server) = duplex(64 * 1024);
        job("T0").write_to(&mut client).await.unwrap();
        handler.handle(server).await.unwrap();

        let accepted = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(accepted.status, ACK_OK);
        let allocated = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(allocated.status, ACK_OK);

        let records = vec![
            BlockRecord::new(1, b"one".to_vec()),
            BlockRecord::new(2, b"two".to_vec()),
        ];
        let mut packer = Packer::new(&mut client);
        for record in &records {
            packer.pack(record).await.unwrap();
        }
        packer.finish().await.unwrap();

        wait_until("drive release", || !handler.registry.is_allocated("T0")).await;
        assert_eq!(*drive_io.written.lock(), records);
    }

    #[tokio::test]
    async fn shutdown_aborts_a_running_session() {
        let drive_io = Arc::new(RecordingDrive::default());
        let daemon = Daemon::new(config(&["T0"]), drive_io).unwrap();
        let handler = daemon.handler();

        let (mut client, server) = duplex(4096);
        job("T0").write_to(&mut client).await.unwrap();
        handler.handle(server).await.unwrap();

        let accepted = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(accepted.status, ACK_OK);
        let allocated = JobAck::read_from(&mut client).await.unwrap();
        assert_eq!(allocated.status, ACK_OK);
        assert!(handler.registry.is_allocated("T0"));

        // The peer sends nothing; only the shutdown signal ends the session.
        daemon.shutdown();
        wait_until("drive release", || !handler.registry.is_allocated("T0")).await;
    }
}
