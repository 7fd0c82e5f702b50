//! Migration records, assessments and the durable metadata snapshot.

use crate::{DriveInfo, FerryError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a migration:
/// `Pending → Analyzing → Ready → InProgress → {Completed | Failed} → RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Analyzing,
    Ready,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::RolledBack
        )
    }

    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Analyzing)
                | (Analyzing, Ready)
                | (Ready, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Completed, RolledBack)
                | (Failed, RolledBack)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Analyzing => "analyzing",
            MigrationStatus::Ready => "ready",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        };
        write!(f, "{}", name)
    }
}

/// A file recorded at assessment time for spot-check verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileIntegritySample {
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 hex digest; empty when the file was over the checksum limit.
    pub checksum: String,
    pub modified: DateTime<Utc>,
}

impl FileIntegritySample {
    pub fn has_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationAssessment {
    pub source: DriveInfo,
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub estimated_duration_hours: f64,
    pub space_required_bytes: u64,
    pub compatibility_issues: Vec<String>,
    pub integrity_samples: Vec<FileIntegritySample>,
    pub recommendations: Vec<String>,
}

/// Durable plan inputs, written once at plan creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationMetadata {
    pub migration_id: String,
    pub created_at: DateTime<Utc>,
    pub source: DriveInfo,
    pub targets: Vec<DriveInfo>,
    pub target_filesystem: String,
    pub assessment: MigrationAssessment,
}

impl MigrationMetadata {
    pub fn primary_target(&self) -> Option<&DriveInfo> {
        self.targets.first()
    }
}

/// Mutable state of one migration. Owned by the store; every change goes
/// through the methods below so the counters and status stay consistent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub source_device: String,
    pub target_devices: Vec<String>,
    pub status: MigrationStatus,
    pub files_migrated: u64,
    pub total_files: u64,
    pub bytes_migrated: u64,
    pub total_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub rollback_available: bool,
}

impl MigrationRecord {
    pub fn new(
        migration_id: impl Into<String>,
        source_device: impl Into<String>,
        target_devices: Vec<String>,
    ) -> Self {
        Self {
            migration_id: migration_id.into(),
            source_device: source_device.into(),
            target_devices,
            status: MigrationStatus::Pending,
            files_migrated: 0,
            total_files: 0,
            bytes_migrated: 0,
            total_bytes: 0,
            started_at: None,
            completed_at: None,
            estimated_completion: None,
            error_message: None,
            rollback_available: false,
        }
    }

    pub fn transition(&mut self, next: MigrationStatus) -> Result<(), FerryError> {
        if !self.status.can_transition_to(next) {
            return Err(FerryError::InvalidInput(format!(
                "migration {} cannot move from {} to {}",
                self.migration_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn set_totals(&mut self, total_files: u64, total_bytes: u64) {
        self.total_files = total_files;
        self.total_bytes = total_bytes;
        self.files_migrated = self.files_migrated.min(total_files);
        self.bytes_migrated = self.bytes_migrated.min(total_bytes);
    }

    pub fn mark_started(&mut self) -> Result<(), FerryError> {
        self.transition(MigrationStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        self.rollback_available = true;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), FerryError> {
        self.transition(MigrationStatus::Completed)?;
        self.files_migrated = self.total_files;
        self.bytes_migrated = self.total_bytes;
        self.completed_at = Some(Utc::now());
        self.estimated_completion = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), FerryError> {
        self.transition(MigrationStatus::Failed)?;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        self.estimated_completion = None;
        Ok(())
    }

    /// Final state after a rollback ran all of its steps, whether or not
    /// each of them succeeded.
    pub fn mark_rolled_back(&mut self, problems: Option<String>) -> Result<(), FerryError> {
        if !self.rollback_available {
            return Err(FerryError::RollbackUnavailable(self.migration_id.clone()));
        }
        self.transition(MigrationStatus::RolledBack)?;
        self.rollback_available = false;
        if let Some(problems) = problems {
            self.error_message = Some(problems);
        }
        Ok(())
    }

    /// Raise the migrated file count. Lower values are stale and ignored.
    pub fn record_files_done(&mut self, done: u64) -> bool {
        let done = done.min(self.total_files);
        if done > self.files_migrated {
            self.files_migrated = done;
            true
        } else {
            false
        }
    }

    /// Raise the migrated byte count. Lower values are stale and ignored.
    pub fn record_bytes_done(&mut self, done: u64) -> bool {
        let done = done.min(self.total_bytes);
        if done > self.bytes_migrated {
            self.bytes_migrated = done;
            true
        } else {
            false
        }
    }

    pub fn set_estimated_completion(&mut self, remaining: Duration) {
        self.estimated_completion = Some(Utc::now() + remaining);
    }

    pub fn file_ratio(&self) -> f64 {
        ratio(self.files_migrated, self.total_files)
    }

    pub fn byte_ratio(&self) -> f64 {
        ratio(self.bytes_migrated, self.total_bytes)
    }

    /// Wall time between start and completion, when both are known.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_record() -> MigrationRecord {
        let mut record = MigrationRecord::new("m1", "/dev/sdb1", vec!["/dev/sdc1".to_string()]);
        record.transition(MigrationStatus::Analyzing).unwrap();
        record.set_totals(100, 10_000);
        record.transition(MigrationStatus::Ready).unwrap();
        record
    }

    #[test]
    fn test_record_never_reenters_ready() {
        let mut record = ready_record();
        record.mark_started().unwrap();
        assert!(record.transition(MigrationStatus::Ready).is_err());
        assert_eq!(record.status, MigrationStatus::InProgress);
    }

    #[test]
    fn test_counters_are_clamped_and_monotonic() {
        let mut record = ready_record();
        record.mark_started().unwrap();

        assert!(record.record_files_done(40));
        assert!(!record.record_files_done(30));
        assert_eq!(record.files_migrated, 40);

        record.record_files_done(500);
        assert_eq!(record.files_migrated, 100);

        record.record_bytes_done(20_000);
        assert_eq!(record.bytes_migrated, 10_000);
    }

    #[test]
    fn test_completion_fills_counters() {
        let mut record = ready_record();
        record.mark_started().unwrap();
        record.mark_completed().unwrap();
        assert_eq!(record.file_ratio(), 1.0);
        assert!(record.duration().is_some());
        assert!(record.rollback_available);
    }

    #[test]
    fn test_rollback_only_once() {
        let mut record = ready_record();
        record.mark_started().unwrap();
        record.mark_failed("copy failed").unwrap();

        record.mark_rolled_back(None).unwrap();
        assert!(!record.rollback_available);
        assert!(matches!(
            record.mark_rolled_back(None),
            Err(FerryError::RollbackUnavailable(_))
        ));
        assert_eq!(record.error_message.as_deref(), Some("copy failed"));
    }

    #[test]
    fn test_ready_cannot_roll_back() {
        let mut record = ready_record();
        record.rollback_available = true;
        assert!(record.mark_rolled_back(None).is_err());
        assert_eq!(record.status, MigrationStatus::Ready);
    }

    #[test]
    fn test_zero_totals_ratio() {
        let record = MigrationRecord::new("m1", "/dev/sdb1", vec![]);
        assert_eq!(record.file_ratio(), 0.0);
        assert_eq!(record.byte_ratio(), 0.0);
    }
}
