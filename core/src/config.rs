use crate::FerryError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SAMPLE_STRIDE: usize = 1000;
pub const DEFAULT_CHECKSUM_SIZE_LIMIT: u64 = 10 * 1024 * 1024;
pub const DEFAULT_THROUGHPUT_BYTES_PER_SEC: u64 = 100 * 1024 * 1024;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Settings for the migration manager. Every field has a default so a
/// config file only needs the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Filesystem the source drive must carry.
    pub source_filesystem: String,
    /// Filesystem targets are formatted to.
    pub target_filesystem: String,
    /// Holds `<id>_metadata.json`, `<id>_progress.json` and `<id>_backup/`.
    pub work_dir: PathBuf,
    /// Parent directory for target mount points that have none yet.
    pub mount_root: PathBuf,
    pub fstab_path: PathBuf,
    pub mount_unit_dir: PathBuf,
    pub mount_table_path: PathBuf,
    /// Filesystem type passed to mount when the source is re-mounted.
    pub source_mount_fstype: String,
    pub target_mount_options: String,
    pub sample_stride: usize,
    pub checksum_size_limit: u64,
    pub assumed_throughput_bytes_per_sec: u64,
    pub command_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_filesystem: "ntfs".to_string(),
            target_filesystem: "ext4".to_string(),
            work_dir: default_work_dir(),
            mount_root: PathBuf::from("/mnt"),
            fstab_path: PathBuf::from("/etc/fstab"),
            mount_unit_dir: PathBuf::from("/etc/systemd/system"),
            mount_table_path: PathBuf::from("/proc/mounts"),
            source_mount_fstype: "ntfs3".to_string(),
            target_mount_options: "defaults,nofail".to_string(),
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            checksum_size_limit: DEFAULT_CHECKSUM_SIZE_LIMIT,
            assumed_throughput_bytes_per_sec: DEFAULT_THROUGHPUT_BYTES_PER_SEC,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

fn default_work_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("ferry").join("migrations"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/ferry/migrations"))
}

impl MigrationConfig {
    /// Load a JSON config file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FerryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FerryError::Configuration(format!("{}: {}", path.display(), e)))?;
        let config: MigrationConfig = serde_json::from_str(&content)
            .map_err(|e| FerryError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FerryError> {
        if self.source_filesystem.trim().is_empty() || self.target_filesystem.trim().is_empty() {
            return Err(FerryError::Configuration(
                "source_filesystem and target_filesystem must be set".to_string(),
            ));
        }
        if self.sample_stride == 0 {
            return Err(FerryError::Configuration("sample_stride must be at least 1".to_string()));
        }
        if self.assumed_throughput_bytes_per_sec == 0 {
            return Err(FerryError::Configuration(
                "assumed_throughput_bytes_per_sec must be positive".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(FerryError::Configuration(
                "command_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Config rooted in `work_dir` with every system path redirected under it.
    /// Used by tests and dry runs so nothing outside the directory is touched.
    pub fn sandboxed(work_dir: &Path) -> Self {
        let etc = work_dir.join("etc");
        Self {
            work_dir: work_dir.join("state"),
            mount_root: work_dir.join("mnt"),
            fstab_path: etc.join("fstab"),
            mount_unit_dir: etc.join("systemd"),
            mount_table_path: work_dir.join("mounts"),
            ..Self::default()
        }
    }
}
