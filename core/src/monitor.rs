//! Progress snapshots and health signals for running migrations.

use crate::model::{MigrationRecord, MigrationStatus};
use crate::FerryError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// No progress at all after this long means the copy is stuck.
pub const STALL_AFTER_MINUTES: i64 = 60;
/// Slow-progress checks start after this long.
pub const SLOW_AFTER_MINUTES: i64 = 30;
/// Minimum expected progress, in percent per elapsed hour, capped at
/// [`MIN_EXPECTED_PERCENT_CAP`].
pub const MIN_EXPECTED_PERCENT_PER_HOUR: f64 = 2.0;
pub const MIN_EXPECTED_PERCENT_CAP: f64 = 50.0;
pub const CRITICAL_FREE_RATIO: f64 = 0.10;
pub const WARNING_FREE_RATIO: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl FreeSpace {
    pub fn free_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.available_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Reports free space on the filesystem holding `path`.
pub trait SpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> Result<FreeSpace, FerryError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub migration_id: String,
    pub status: MigrationStatus,
    pub files_migrated: u64,
    pub total_files: u64,
    pub bytes_migrated: u64,
    pub total_bytes: u64,
    pub files_percent: f64,
    pub bytes_percent: f64,
    pub elapsed_seconds: Option<i64>,
    pub estimated_remaining_seconds: Option<i64>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Linear extrapolation of the time left: `elapsed * (100 / percent - 1)`.
pub fn extrapolate_remaining(elapsed: Duration, percent: f64) -> Option<Duration> {
    if percent <= 0.0 {
        return None;
    }
    let elapsed_ms = elapsed.num_milliseconds() as f64;
    let remaining_ms = elapsed_ms * (100.0 / percent - 1.0);
    Some(Duration::milliseconds(remaining_ms.max(0.0) as i64))
}

pub fn progress_snapshot(record: &MigrationRecord, now: DateTime<Utc>) -> ProgressSnapshot {
    let files_percent = percent(record.files_migrated, record.total_files);
    let bytes_percent = percent(record.bytes_migrated, record.total_bytes);

    let elapsed = match (record.status, record.started_at) {
        (MigrationStatus::InProgress, Some(started)) => Some(now - started),
        _ => None,
    };
    let remaining = elapsed.and_then(|elapsed| extrapolate_remaining(elapsed, files_percent));

    ProgressSnapshot {
        migration_id: record.migration_id.clone(),
        status: record.status,
        files_migrated: record.files_migrated,
        total_files: record.total_files,
        bytes_migrated: record.bytes_migrated,
        total_bytes: record.total_bytes,
        files_percent,
        bytes_percent,
        elapsed_seconds: elapsed.map(|d| d.num_seconds()),
        estimated_remaining_seconds: remaining.map(|d| d.num_seconds()),
        estimated_completion: record.estimated_completion,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Slow,
    Stalled,
    Critical,
    Failed,
    Completed,
    CompletedWithIssues,
    Idle,
    RolledBack,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Slow => "slow",
            HealthStatus::Stalled => "stalled",
            HealthStatus::Critical => "critical",
            HealthStatus::Failed => "failed",
            HealthStatus::Completed => "completed",
            HealthStatus::CompletedWithIssues => "completed_with_issues",
            HealthStatus::Idle => "idle",
            HealthStatus::RolledBack => "rolled_back",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub migration_id: String,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Free-space reading for one target mount point.
#[derive(Debug)]
pub struct TargetSpace {
    pub mount_point: PathBuf,
    pub reading: Result<FreeSpace, FerryError>,
}

/// Health of an in-progress migration. Every problem found is listed; the
/// status is the most severe one (critical, stalled, slow, warning).
pub fn running_health(
    record: &MigrationRecord,
    now: DateTime<Utc>,
    targets: &[TargetSpace],
) -> (HealthStatus, Vec<String>) {
    let mut issues = Vec::new();
    let mut stalled = false;
    let mut slow = false;
    let mut critical = false;
    let mut warning = false;

    let pct = percent(record.files_migrated, record.total_files);
    if let Some(started) = record.started_at {
        let elapsed = now - started;
        if elapsed > Duration::minutes(STALL_AFTER_MINUTES) && pct == 0.0 {
            stalled = true;
            issues.push(format!(
                "No progress after {} minutes",
                elapsed.num_minutes()
            ));
        } else if elapsed > Duration::minutes(SLOW_AFTER_MINUTES) {
            let hours = elapsed.num_seconds() as f64 / 3600.0;
            let expected = (hours * MIN_EXPECTED_PERCENT_PER_HOUR).min(MIN_EXPECTED_PERCENT_CAP);
            if pct < expected {
                slow = true;
                issues.push(format!(
                    "Progress {:.1}% is below the expected minimum of {:.1}% after {:.1} hours",
                    pct, expected, hours
                ));
            }
        }
    }

    for target in targets {
        match &target.reading {
            Ok(space) => {
                let ratio = space.free_ratio();
                if ratio < CRITICAL_FREE_RATIO {
                    critical = true;
                    issues.push(format!(
                        "Target {} is critically low on space ({:.1}% free)",
                        target.mount_point.display(),
                        ratio * 100.0
                    ));
                } else if ratio < WARNING_FREE_RATIO {
                    warning = true;
                    issues.push(format!(
                        "Target {} is low on space ({:.1}% free)",
                        target.mount_point.display(),
                        ratio * 100.0
                    ));
                }
            }
            Err(e) => {
                warning = true;
                issues.push(format!(
                    "Cannot read free space on {}: {}",
                    target.mount_point.display(),
                    e
                ));
            }
        }
    }

    let status = if critical {
        HealthStatus::Critical
    } else if stalled {
        HealthStatus::Stalled
    } else if slow {
        HealthStatus::Slow
    } else if warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    (status, issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(files_done: u64, started_minutes_ago: i64, now: DateTime<Utc>) -> MigrationRecord {
        let mut record = MigrationRecord::new("m1", "/dev/sdb1", vec!["/dev/sdc1".to_string()]);
        record.transition(MigrationStatus::Analyzing).unwrap();
        record.set_totals(100, 1000);
        record.transition(MigrationStatus::Ready).unwrap();
        record.mark_started().unwrap();
        record.started_at = Some(now - Duration::minutes(started_minutes_ago));
        record.record_files_done(files_done);
        record
    }

    fn space(mount: &str, free_percent: u64) -> TargetSpace {
        TargetSpace {
            mount_point: PathBuf::from(mount),
            reading: Ok(FreeSpace {
                total_bytes: 100,
                available_bytes: free_percent,
            }),
        }
    }

    #[test]
    fn test_snapshot_extrapolates_remaining_time() {
        let now = Utc::now();
        let record = running(25, 60, now);
        let snapshot = progress_snapshot(&record, now);
        assert_eq!(snapshot.files_percent, 25.0);
        assert_eq!(snapshot.elapsed_seconds, Some(3600));
        assert_eq!(snapshot.estimated_remaining_seconds, Some(3 * 3600));
    }

    #[test]
    fn test_snapshot_without_progress_omits_remaining() {
        let now = Utc::now();
        let record = running(0, 10, now);
        let snapshot = progress_snapshot(&record, now);
        assert_eq!(snapshot.files_percent, 0.0);
        assert_eq!(snapshot.bytes_percent, 0.0);
        assert_eq!(snapshot.estimated_remaining_seconds, None);
    }

    #[test]
    fn test_zero_totals_report_zero_percent() {
        let record = MigrationRecord::new("m1", "/dev/sdb1", vec![]);
        let snapshot = progress_snapshot(&record, Utc::now());
        assert_eq!(snapshot.files_percent, 0.0);
        assert_eq!(snapshot.elapsed_seconds, None);
    }

    #[test]
    fn test_stalled_after_an_hour_without_progress() {
        let now = Utc::now();
        let (status, issues) = running_health(&running(0, 61, now), now, &[]);
        assert_eq!(status, HealthStatus::Stalled);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_slow_below_minimum_curve() {
        let now = Utc::now();
        // 5 hours in, minimum expected is 10%.
        let (status, _) = running_health(&running(5, 300, now), now, &[]);
        assert_eq!(status, HealthStatus::Slow);
        let (status, _) = running_health(&running(15, 300, now), now, &[]);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn test_low_space_levels() {
        let now = Utc::now();
        let record = running(50, 10, now);

        let (status, issues) = running_health(&record, now, &[space("/mnt/disk1", 5)]);
        assert_eq!(status, HealthStatus::Critical);
        assert!(issues.iter().any(|i| i.contains("/mnt/disk1")));

        let (status, _) = running_health(&record, now, &[space("/mnt/disk1", 15)]);
        assert_eq!(status, HealthStatus::Warning);

        let (status, issues) = running_health(&record, now, &[space("/mnt/disk1", 50)]);
        assert_eq!(status, HealthStatus::Healthy);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_critical_outranks_stalled() {
        let now = Utc::now();
        let (status, issues) =
            running_health(&running(0, 120, now), now, &[space("/mnt/disk2", 1)]);
        assert_eq!(status, HealthStatus::Critical);
        assert_eq!(issues.len(), 2);
    }
}
