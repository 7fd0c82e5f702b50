use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Snapshot of one block device or partition as reported by drive discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveInfo {
    pub device: String,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub filesystem: Option<String>,
    pub role: DriveRole,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub health: DriveHealth,
}

impl DriveInfo {
    /// True when the drive reports `filesystem` (case-insensitive).
    pub fn has_filesystem(&self, filesystem: &str) -> bool {
        self.filesystem
            .as_deref()
            .map(|fs| fs.eq_ignore_ascii_case(filesystem))
            .unwrap_or(false)
    }

    /// Last path component of the device, e.g. `sdb1` for `/dev/sdb1`.
    pub fn short_name(&self) -> &str {
        self.device.rsplit('/').next().unwrap_or(&self.device)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriveRole {
    Data,
    Parity,
    Unassigned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriveHealth {
    Healthy,
    Warning,
    Failing,
    Unknown,
}

impl fmt::Display for DriveRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveRole::Data => write!(f, "data"),
            DriveRole::Parity => write!(f, "parity"),
            DriveRole::Unassigned => write!(f, "unassigned"),
        }
    }
}

impl fmt::Display for DriveHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveHealth::Healthy => write!(f, "healthy"),
            DriveHealth::Warning => write!(f, "warning"),
            DriveHealth::Failing => write!(f, "failing"),
            DriveHealth::Unknown => write!(f, "unknown"),
        }
    }
}

#[async_trait::async_trait]
pub trait DriveDiscovery: Send + Sync {
    async fn discover_drives(&self) -> Result<Vec<DriveInfo>, crate::FerryError>;
}
