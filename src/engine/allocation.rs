//! Drive allocation protocol engine.
//!
//! Negotiates exclusive reservation of one drive with the allocation
//! collaborator, driving a per-session state machine:
//!
//! `Idle -> Requesting -> Allocated | Rejected | Failed`
//!
//! `Rejected` and `Failed` are terminal with no drive held. On `Allocated`
//! the drive handle is handed to the bridge engine and this engine becomes
//! inert.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::drive::{AllocationCollaborator, DriveHandle};
use crate::error::{Result, TapeBridgeError};
use crate::fsm::{StateMachine, Transition};
use crate::session::AllocationSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationState {
    Idle,
    Requesting,
    Allocated,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AllocationEvent {
    Request,
    Grant,
    Deny,
    Fail,
}

pub struct DriveAllocationProtocolEngine {
    session: AllocationSession,
    fsm: StateMachine<AllocationState, AllocationEvent, AllocationSession>,
    collaborator: Arc<dyn AllocationCollaborator>,
    timeout: Duration,
}

impl DriveAllocationProtocolEngine {
    pub fn new(
        session: AllocationSession,
        collaborator: Arc<dyn AllocationCollaborator>,
        timeout: Duration,
    ) -> Result<Self> {
        let fsm = Self::transition_table()?;
        Ok(Self {
            session,
            fsm,
            collaborator,
            timeout,
        })
    }

    fn transition_table(
    ) -> Result<StateMachine<AllocationState, AllocationEvent, AllocationSession>> {
        use AllocationEvent::*;
        use AllocationState::*;

        let mut fsm = StateMachine::new(Idle);
        fsm.register(
            Transition {
                from: Idle,
                to: Requesting,
                event: Request,
            },
            Some(Box::new(|session: &mut AllocationSession| {
                debug!(
                    session = %session.id,
                    dgn = %session.criteria.dgn,
                    "requesting drive allocation"
                );
                Ok(())
            })),
        )?;
        fsm.register(
            Transition {
                from: Requesting,
                to: Allocated,
                event: Grant,
            },
            None,
        )?;
        fsm.register(
            Transition {
                from: Requesting,
                to: Rejected,
                event: Deny,
            },
            Some(Box::new(|session: &mut AllocationSession| {
                info!(session = %session.id, "drive allocation denied");
                Ok(())
            })),
        )?;
        fsm.register(
            Transition {
                from: Requesting,
                to: Failed,
                event: Fail,
            },
            Some(Box::new(|session: &mut AllocationSession| {
                warn!(session = %session.id, "drive allocation failed");
                Ok(())
            })),
        )?;
        Ok(fsm)
    }

    pub fn state(&self) -> AllocationState {
        self.fsm.current()
    }

    pub fn session(&self) -> &AllocationSession {
        &self.session
    }

    /// Run the allocation conversation to a terminal state.
    ///
    /// The collaborator gets a bounded wait; exceeding it counts as a
    /// transport failure. Errors never escape as anything other than the
    /// terminal state plus the returned detail.
    pub async fn allocate(&mut self) -> Result<DriveHandle> {
        self.fsm.fire(AllocationEvent::Request, &mut self.session)?;

        let response = tokio::time::timeout(
            self.timeout,
            self.collaborator.request_drive(&self.session.criteria),
        )
        .await;

        match response {
            Ok(Ok(handle)) => {
                self.fsm.fire(AllocationEvent::Grant, &mut self.session)?;
                info!(
                    session = %self.session.id,
                    unit = %handle.unit,
                    "drive allocated"
                );
                Ok(handle)
            }
            Ok(Err(error @ TapeBridgeError::Rejected(_))) => {
                self.fsm.fire(AllocationEvent::Deny, &mut self.session)?;
                Err(error)
            }
            Ok(Err(error)) => {
                self.fsm.fire(AllocationEvent::Fail, &mut self.session)?;
                Err(error)
            }
            Err(_elapsed) => {
                // The collaborator call is dropped before any reservation
                // could be observed, so nothing is tentatively held.
                self.fsm.fire(AllocationEvent::Fail, &mut self.session)?;
                Err(TapeBridgeError::timeout(format!(
                    "no allocation response within {:?}",
                    self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveCriteria;
    use async_trait::async_trait;

    struct GrantingCollaborator;

    #[async_trait]
    impl AllocationCollaborator for GrantingCollaborator {
        async fn request_drive(&self, criteria: &DriveCriteria) -> Result<DriveHandle> {
            Ok(DriveHandle {
                unit: "T0".to_string(),
                dgn: criteria.dgn.clone(),
                device: "/dev/nst0".to_string(),
            })
        }

        async fn release_drive(&self, _handle: &DriveHandle) -> Result<()> {
            Ok(())
        }
    }

    struct DenyingCollaborator;

    #[async_trait]
    impl AllocationCollaborator for DenyingCollaborator {
        async fn request_drive(&self, _criteria: &DriveCriteria) -> Result<DriveHandle> {
            Err(TapeBridgeError::rejected("no free drive"))
        }

        async fn release_drive(&self, _handle: &DriveHandle) -> Result<()> {
            Ok(())
        }
    }

    struct BrokenCollaborator;

    #[async_trait]
    impl AllocationCollaborator for BrokenCollaborator {
        async fn request_drive(&self, _criteria: &DriveCriteria) -> Result<DriveHandle> {
            Err(TapeBridgeError::drive("vdqm connection reset"))
        }

        async fn release_drive(&self, _handle: &DriveHandle) -> Result<()> {
            Ok(())
        }
    }

    struct StalledCollaborator;

    #[async_trait]
    impl AllocationCollaborator for StalledCollaborator {
        async fn request_drive(&self, _criteria: &DriveCriteria) -> Result<DriveHandle> {
            std::future::pending().await
        }

        async fn release_drive(&self, _handle: &DriveHandle) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> AllocationSession {
        AllocationSession::new(
            DriveCriteria {
                dgn: "T10KD6".to_string(),
                unit: None,
            },
            "stage".to_string(),
        )
    }

    fn engine(
        collaborator: Arc<dyn AllocationCollaborator>,
    ) -> DriveAllocationProtocolEngine {
        DriveAllocationProtocolEngine::new(session(), collaborator, Duration::from_millis(50))
            .unwrap()
    }

    #[tokio::test]
    async fn grant_reaches_allocated() {
        let mut engine = engine(Arc::new(GrantingCollaborator));
        assert_eq!(engine.state(), AllocationState::Idle);

        let handle = engine.allocate().await.unwrap();
        assert_eq!(engine.state(), AllocationState::Allocated);
        assert_eq!(handle.unit, "T0");
    }

    #[tokio::test]
    async fn denial_reaches_rejected_with_no_drive() {
        let mut engine = engine(Arc::new(DenyingCollaborator));
        let result = engine.allocate().await;
        assert!(matches!(result, Err(TapeBridgeError::Rejected(_))));
        assert_eq!(engine.state(), AllocationState::Rejected);
    }

    #[tokio::test]
    async fn transport_error_reaches_failed() {
        let mut engine = engine(Arc::new(BrokenCollaborator));
        let result = engine.allocate().await;
        assert!(matches!(result, Err(TapeBridgeError::Drive(_))));
        assert_eq!(engine.state(), AllocationState::Failed);
    }

    #[tokio::test]
    async fn unresponsive_collaborator_times_out() {
        let mut engine = engine(Arc::new(StalledCollaborator));
        let result = engine.allocate().await;
        assert!(matches!(result, Err(TapeBridgeError::Timeout(_))));
        assert_eq!(engine.state(), AllocationState::Failed);
    }
}
