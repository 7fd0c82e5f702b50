//! Per-migration reports and fleet-wide statistics.

use crate::model::{MigrationMetadata, MigrationRecord, MigrationStatus};
use crate::verify::VerificationOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration_id: String,
    pub status: MigrationStatus,
    pub source_device: String,
    pub target_devices: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub transfer_rate_bytes_per_sec: Option<f64>,
    pub files_migrated: u64,
    pub total_files: u64,
    pub bytes_migrated: u64,
    pub total_bytes: u64,
    pub file_success_rate: f64,
    pub byte_success_rate: f64,
    pub validation: Option<VerificationOutcome>,
    pub compatibility_issue_count: usize,
    pub recommendations: Vec<String>,
    pub error_message: Option<String>,
    pub rollback_available: bool,
}

impl MigrationReport {
    pub fn build(
        record: &MigrationRecord,
        metadata: Option<&MigrationMetadata>,
        validation: Option<VerificationOutcome>,
        now: DateTime<Utc>,
    ) -> Self {
        let duration = record.duration().or_else(|| match (record.status, record.started_at) {
            (MigrationStatus::InProgress, Some(started)) => Some(now - started),
            _ => None,
        });
        let duration_seconds = duration.map(|d| d.num_seconds());
        let transfer_rate_bytes_per_sec = duration
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .filter(|secs| *secs > 0.0)
            .map(|secs| record.bytes_migrated as f64 / secs);

        Self {
            migration_id: record.migration_id.clone(),
            status: record.status,
            source_device: record.source_device.clone(),
            target_devices: record.target_devices.clone(),
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_seconds,
            transfer_rate_bytes_per_sec,
            files_migrated: record.files_migrated,
            total_files: record.total_files,
            bytes_migrated: record.bytes_migrated,
            total_bytes: record.total_bytes,
            file_success_rate: record.file_ratio(),
            byte_success_rate: record.byte_ratio(),
            validation,
            compatibility_issue_count: metadata
                .map(|m| m.assessment.compatibility_issues.len())
                .unwrap_or(0),
            recommendations: metadata
                .map(|m| m.assessment.recommendations.clone())
                .unwrap_or_default(),
            error_message: record.error_message.clone(),
            rollback_available: record.rollback_available,
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Migration {}", self.migration_id)?;
        writeln!(f, "  Status:      {}", self.status)?;
        writeln!(f, "  Source:      {}", self.source_device)?;
        writeln!(f, "  Targets:     {}", self.target_devices.join(", "))?;
        if let Some(started) = self.started_at {
            writeln!(f, "  Started:     {}", started.to_rfc3339())?;
        }
        if let Some(completed) = self.completed_at {
            writeln!(f, "  Finished:    {}", completed.to_rfc3339())?;
        }
        if let Some(secs) = self.duration_seconds {
            writeln!(
                f,
                "  Duration:    {}h {:02}m {:02}s",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60
            )?;
        }
        if let Some(rate) = self.transfer_rate_bytes_per_sec {
            writeln!(f, "  Throughput:  {}/s", format_bytes(rate as u64))?;
        }
        writeln!(
            f,
            "  Files:       {}/{} ({:.1}%)",
            self.files_migrated,
            self.total_files,
            self.file_success_rate * 100.0
        )?;
        writeln!(
            f,
            "  Data:        {}/{} ({:.1}%)",
            format_bytes(self.bytes_migrated),
            format_bytes(self.total_bytes),
            self.byte_success_rate * 100.0
        )?;
        match &self.validation {
            Some(outcome) if outcome.passed => writeln!(
                f,
                "  Validation:  passed ({} sampled files)",
                outcome.samples_checked
            )?,
            Some(outcome) => {
                writeln!(
                    f,
                    "  Validation:  FAILED ({} of {} sampled files)",
                    outcome.errors.len(),
                    outcome.samples_checked
                )?;
                for error in &outcome.errors {
                    writeln!(f, "    - {}", error)?;
                }
            }
            None => writeln!(f, "  Validation:  not run")?,
        }
        if self.compatibility_issue_count > 0 {
            writeln!(f, "  Compatibility issues: {}", self.compatibility_issue_count)?;
        }
        if let Some(error) = &self.error_message {
            writeln!(f, "  Error:       {}", error)?;
        }
        writeln!(
            f,
            "  Rollback:    {}",
            if self.rollback_available { "available" } else { "not available" }
        )?;
        if !self.recommendations.is_empty() {
            writeln!(f, "  Recommendations:")?;
            for recommendation in &self.recommendations {
                writeln!(f, "    - {}", recommendation)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MigrationStatistics {
    pub total_migrations: usize,
    pub by_status: BTreeMap<MigrationStatus, usize>,
    pub total_files_migrated: u64,
    pub total_bytes_migrated: u64,
    /// Over finished migrations that have both timestamps.
    pub average_duration_seconds: Option<f64>,
    /// Fraction of files migrated, over finished migrations with files.
    pub average_success_rate: Option<f64>,
}

pub fn statistics(records: &[MigrationRecord]) -> MigrationStatistics {
    let mut stats = MigrationStatistics {
        total_migrations: records.len(),
        ..MigrationStatistics::default()
    };

    let mut durations = Vec::new();
    let mut rates = Vec::new();

    for record in records {
        *stats.by_status.entry(record.status).or_insert(0) += 1;
        stats.total_files_migrated += record.files_migrated;
        stats.total_bytes_migrated += record.bytes_migrated;

        if !record.status.is_terminal() {
            continue;
        }
        if let Some(duration) = record.duration() {
            durations.push(duration.num_milliseconds() as f64 / 1000.0);
        }
        if record.total_files > 0 {
            rates.push(record.file_ratio());
        }
    }

    stats.average_duration_seconds = average(&durations);
    stats.average_success_rate = average(&rates);
    stats
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
