//! On-disk layout of the migration work directory.
//!
//! ```text
//! <work_dir>/<id>_metadata.json   plan inputs, written once
//! <work_dir>/<id>_progress.json   last record snapshot
//! <work_dir>/<id>_backup/         configuration saved before the run
//! ```
//!
//! Every JSON file is written to a temporary sibling first and renamed into
//! place, so a crash never leaves a half-written file behind.

use crate::model::{MigrationMetadata, MigrationRecord};
use crate::FerryError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

const METADATA_SUFFIX: &str = "_metadata.json";
const PROGRESS_SUFFIX: &str = "_progress.json";
const BACKUP_SUFFIX: &str = "_backup";
const LOCK_SUFFIX: &str = ".lock";
const MAX_ID_LEN: usize = 128;

/// Reject ids that would not make a safe single path component.
pub fn validate_migration_id(id: &str) -> Result<(), FerryError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FerryError::InvalidInput(format!(
            "migration id '{}' must be 1-{} characters of letters, digits, '-', '_' or '.'",
            id, MAX_ID_LEN
        )))
    }
}

/// Write `bytes` to `path` through a temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FerryError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| FerryError::persistence(path, "path has no file name"))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        FerryError::persistence(path, e)
    })
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), FerryError> {
    let content = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &content)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, FerryError> {
    let content = std::fs::read(path).map_err(|e| FerryError::persistence(path, e))?;
    serde_json::from_slice(&content).map_err(|e| FerryError::persistence(path, e))
}

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<(), FerryError> {
        std::fs::create_dir_all(&self.root).map_err(|e| FerryError::persistence(&self.root, e))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, METADATA_SUFFIX))
    }

    pub fn progress_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, PROGRESS_SUFFIX))
    }

    /// Held by whichever process is running or rolling back `id`.
    pub fn lock_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, LOCK_SUFFIX))
    }

    pub fn backup_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, BACKUP_SUFFIX))
    }

    pub fn save_metadata(&self, metadata: &MigrationMetadata) -> Result<(), FerryError> {
        write_json_atomic(&self.metadata_path(&metadata.migration_id), metadata)
    }

    pub fn load_metadata(&self, id: &str) -> Result<MigrationMetadata, FerryError> {
        read_json(&self.metadata_path(id))
    }

    pub fn save_record(&self, record: &MigrationRecord) -> Result<(), FerryError> {
        write_json_atomic(&self.progress_path(&record.migration_id), record)
    }

    /// The snapshot for `id`, or `None` when none was written.
    pub fn load_record(&self, id: &str) -> Result<Option<MigrationRecord>, FerryError> {
        let path = self.progress_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Every record snapshot in the directory. Unreadable snapshots are
    /// logged and skipped.
    pub fn load_records(&self) -> Result<Vec<MigrationRecord>, FerryError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FerryError::persistence(&self.root, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FerryError::persistence(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(PROGRESS_SUFFIX) {
                continue;
            }
            match read_json::<MigrationRecord>(&entry.path()) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Ignoring unreadable snapshot {}: {}", name, e),
            }
        }
        records.sort_by(|a, b| a.migration_id.cmp(&b.migration_id));
        Ok(records)
    }

    /// Delete the metadata, progress and lock files, and the backup
    /// directory when asked to.
    pub fn remove(&self, id: &str, remove_backup: bool) -> Result<(), FerryError> {
        for path in [self.metadata_path(id), self.progress_path(id), self.lock_path(id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FerryError::persistence(&path, e)),
            }
        }

        if remove_backup {
            let backup = self.backup_dir(id);
            match std::fs::remove_dir_all(&backup) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FerryError::persistence(&backup, e)),
            }
        }
        Ok(())
    }
}
