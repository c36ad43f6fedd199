//! Daemon configuration.
//!
//! Loaded from a JSON file at startup. Every timeout has a sane default so a
//! minimal config only needs the listen address and the drive pool.

use crate::error::{Result, TapeBridgeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One physical drive managed by this daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriveConfig {
    /// Drive unit name as known to VDQM (e.g. "T10D6515").
    pub unit: String,
    /// Device group name the drive belongs to (e.g. "T10KD6").
    pub dgn: String,
    /// Local device path handed to the drive collaborator.
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the job listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Drives this daemon owns and may offer for allocation.
    pub drives: Vec<DriveConfig>,

    /// Maximum number of concurrently running sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Seconds to wait for the allocation collaborator to answer.
    #[serde(default = "default_allocation_timeout")]
    pub allocation_timeout_secs: u64,

    /// Seconds to wait for a mount or unmount to complete.
    #[serde(default = "default_mount_timeout")]
    pub mount_timeout_secs: u64,

    /// Seconds to wait for the peer handshake to arrive.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:5070".to_string()
}

fn default_max_sessions() -> usize {
    8
}

fn default_allocation_timeout() -> u64 {
    30
}

fn default_mount_timeout() -> u64 {
    900
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            drives: Vec::new(),
            max_sessions: default_max_sessions(),
            allocation_timeout_secs: default_allocation_timeout(),
            mount_timeout_secs: default_mount_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| TapeBridgeError::config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.drives.is_empty() {
            return Err(TapeBridgeError::config("drive pool is empty"));
        }
        if self.max_sessions == 0 {
            return Err(TapeBridgeError::config("max_sessions must be at least 1"));
        }
        let mut units: Vec<&str> = self.drives.iter().map(|d| d.unit.as_str()).collect();
        units.sort_unstable();
        units.dedup();
        if units.len() != self.drives.len() {
            return Err(TapeBridgeError::config("duplicate drive unit names"));
        }
        Ok(())
    }

    pub fn allocation_timeout(&self) -> Duration {
        Duration::from_secs(self.allocation_timeout_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
