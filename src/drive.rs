//! Drive handles, the drive-status registry, and the collaborator
//! interfaces the engines drive tape hardware through.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DriveConfig;
use crate::error::{Result, TapeBridgeError};
use crate::frame::BlockRecord;

/// Exclusive handle on one physical drive, valid from allocation until
/// release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveHandle {
    pub unit: String,
    pub dgn: String,
    pub device: String,
}

/// What an allocation request asks for: a device group, and optionally one
/// specific drive unit within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveCriteria {
    pub dgn: String,
    pub unit: Option<String>,
}

impl DriveCriteria {
    fn matches(&self, config: &DriveConfig) -> bool {
        if config.dgn != self.dgn {
            return false;
        }
        match &self.unit {
            Some(unit) => *unit == config.unit,
            None => true,
        }
    }
}

/// The drive-scheduling authority the allocation engine negotiates with,
/// and the authority releases go back to.
#[async_trait]
pub trait AllocationCollaborator: Send + Sync {
    /// Reserve a free drive matching the criteria.
    ///
    /// `Rejected` means an explicit denial (no matching free drive); any
    /// other error is a transport failure.
    async fn request_drive(&self, criteria: &DriveCriteria) -> Result<DriveHandle>;

    /// Return a drive to the pool. Must be idempotent: releasing an
    /// already-free drive is a no-op.
    async fn release_drive(&self, handle: &DriveHandle) -> Result<()>;
}

/// Physical drive operations, implemented over the actual device path.
#[async_trait]
pub trait DriveCollaborator: Send + Sync {
    async fn mount(&self, handle: &DriveHandle) -> Result<()>;

    async fn unmount(&self, handle: &DriveHandle) -> Result<()>;

    /// Read the next block from tape; `None` at end of data.
    async fn read_block(&self, handle: &DriveHandle) -> Result<Option<BlockRecord>>;

    async fn write_block(&self, handle: &DriveHandle, record: &BlockRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveStatus {
    Free,
    Allocated,
}

struct DriveEntry {
    config: DriveConfig,
    status: DriveStatus,
}

/// In-process registry of the drives this daemon owns.
///
/// The only state shared across sessions. Status flips are serialized under
/// the registry lock, which is held only for the instant of the flip and
/// never across I/O.
pub struct DriveRegistry {
    drives: Mutex<Vec<DriveEntry>>,
}

impl DriveRegistry {
    pub fn new(drives: Vec<DriveConfig>) -> Self {
        let drives = drives
            .into_iter()
            .map(|config| DriveEntry {
                config,
                status: DriveStatus::Free,
            })
            .collect();
        Self {
            drives: Mutex::new(drives),
        }
    }

    /// Whether this daemon manages a drive with the given unit name.
    pub fn manages_unit(&self, unit: &str) -> bool {
        self.drives
            .lock()
            .iter()
            .any(|entry| entry.config.unit == unit)
    }

    /// Atomically flip the first free matching drive to `Allocated`.
    pub fn try_allocate(&self, criteria: &DriveCriteria) -> Result<DriveHandle> {
        let mut drives = self.drives.lock();
        for entry in drives.iter_mut() {
            if entry.status == DriveStatus::Free && criteria.matches(&entry.config) {
                entry.status = DriveStatus::Allocated;
                debug!(unit = %entry.config.unit, "drive allocated");
                return Ok(DriveHandle {
                    unit: entry.config.unit.clone(),
                    dgn: entry.config.dgn.clone(),
                    device: entry.config.device.clone(),
                });
            }
        }
        Err(TapeBridgeError::rejected(format!(
            "no free drive matching dgn={} unit={}",
            criteria.dgn,
            criteria.unit.as_deref().unwrap_or("*")
        )))
    }

    /// Flip a drive back to `Free`. Returns whether a flip happened;
    /// releasing an already-free or unknown drive is a no-op.
    pub fn release(&self, unit: &str) -> bool {
        let mut drives = self.drives.lock();
        for entry in drives.iter_mut() {
            if entry.config.unit == unit {
                if entry.status == DriveStatus::Allocated {
                    entry.status = DriveStatus::Free;
                    debug!(unit = %unit, "drive released");
                    return true;
                }
                return false;
            }
        }
        warn!(unit = %unit, "release of unknown drive ignored");
        false
    }

    #[cfg(test)]
    pub fn is_allocated(&self, unit: &str) -> bool {
        self.drives
            .lock()
            .iter()
            .any(|entry| entry.config.unit == unit && entry.status == DriveStatus::Allocated)
    }
}

#[async_trait]
impl AllocationCollaborator for DriveRegistry {
    async fn request_drive(&self, criteria: &DriveCriteria) -> Result<DriveHandle> {
        self.try_allocate(criteria)
    }

    async fn release_drive(&self, handle: &DriveHandle) -> Result<()> {
        self.release(&handle.unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(units: &[&str]) -> DriveRegistry {
        DriveRegistry::new(
            units
                .iter()
                .map(|unit| DriveConfig {
                    unit: unit.to_string(),
                    dgn: "T10KD6".to_string(),
                    device: format!("/dev/{}", unit),
                })
                .collect(),
        )
    }

    fn any_drive() -> DriveCriteria {
        DriveCriteria {
            dgn: "T10KD6".to_string(),
            unit: None,
        }
    }

    #[test]
    fn allocate_and_release() {
        let registry = pool(&["T0"]);
        let handle = registry.try_allocate(&any_drive()).unwrap();
        assert_eq!(handle.unit, "T0");
        assert!(registry.is_allocated("T0"));

        // Second attempt against the same pool is denied.
        assert!(matches!(
            registry.try_allocate(&any_drive()),
            Err(TapeBridgeError::Rejected(_))
        ));

        assert!(registry.release("T0"));
        assert!(!registry.is_allocated("T0"));
    }

    #[test]
    fn release_is_idempotent() {
        let registry = pool(&["T0"]);
        registry.try_allocate(&any_drive()).unwrap();
        assert!(registry.release("T0"));
        assert!(!registry.release("T0"));
        assert!(!registry.release("no-such-drive"));
    }

    #[test]
    fn criteria_select_specific_unit() {
        let registry = pool(&["T0", "T1"]);
        let criteria = DriveCriteria {
            dgn: "T10KD6".to_string(),
            unit: Some("T1".to_string()),
        };
        let handle = registry.try_allocate(&criteria).unwrap();
        assert_eq!(handle.unit, "T1");
        assert!(!registry.is_allocated("T0"));
    }

    #[test]
    fn wrong_dgn_rejected() {
        let registry = pool(&["T0"]);
        let criteria = DriveCriteria {
            dgn: "LTO9".to_string(),
            unit: None,
        };
        assert!(matches!(
            registry.try_allocate(&criteria),
            Err(TapeBridgeError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_allocation_grants_at_most_one() {
        let registry = Arc::new(pool(&["T0"]));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.request_drive(&any_drive()).await.is_ok()
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert!(registry.is_allocated("T0"));
    }
}
