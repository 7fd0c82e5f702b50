//! Source volume assessment: size, cost, compatibility and integrity samples.

use crate::config::MigrationConfig;
use crate::model::{FileIntegritySample, MigrationAssessment};
use crate::report::format_bytes;
use crate::verify::sha256_file;
use crate::{DriveInfo, FerryError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name fragments of system and junk entries that are never migrated.
/// Matched case-insensitively anywhere in the entry name, so a regular file
/// such as `my-thumbs.db-notes.txt` is skipped as well.
pub const EXCLUDED_NAME_FRAGMENTS: &[&str] = &[
    "$recycle.bin",
    "system volume information",
    "pagefile.sys",
    "hiberfil.sys",
    "swapfile.sys",
    "thumbs.db",
    "desktop.ini",
    ".ds_store",
];

/// Extensions that only make sense on Windows.
pub const INCOMPATIBLE_EXTENSIONS: &[&str] = &["exe", "msi", "lnk", "bat", "cmd"];

const LARGE_DATASET_BYTES: u64 = 1024 * 1024 * 1024 * 1024;
const LONG_DURATION_HOURS: f64 = 24.0;

pub fn is_excluded_name(name: &OsStr) -> bool {
    let name = name.to_string_lossy().to_lowercase();
    EXCLUDED_NAME_FRAGMENTS
        .iter()
        .any(|fragment| name.contains(fragment))
}

/// `ceil(total * 1.2)` without going through floating point.
pub fn space_required(total_size_bytes: u64) -> u64 {
    (total_size_bytes as u128 * 6).div_ceil(5).min(u64::MAX as u128) as u64
}

pub struct AssessmentEngine {
    source_filesystem: String,
    sample_stride: usize,
    checksum_size_limit: u64,
    throughput_bytes_per_sec: u64,
}

impl AssessmentEngine {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            source_filesystem: config.source_filesystem.clone(),
            sample_stride: config.sample_stride.max(1),
            checksum_size_limit: config.checksum_size_limit,
            throughput_bytes_per_sec: config.assumed_throughput_bytes_per_sec.max(1),
        }
    }

    /// Walk the source drive once and build its assessment. Never writes to
    /// the source. Unreadable entries become compatibility issues; only an
    /// unreadable walk root aborts.
    pub fn assess(&self, drive: &DriveInfo) -> Result<MigrationAssessment, FerryError> {
        if !drive.has_filesystem(&self.source_filesystem) {
            return Err(FerryError::InvalidFilesystem {
                device: drive.device.clone(),
                expected: self.source_filesystem.clone(),
                found: drive.filesystem.clone().unwrap_or_else(|| "none".to_string()),
            });
        }

        let root = drive.mount_point.as_deref().ok_or_else(|| {
            FerryError::InvalidInput(format!("source {} is not mounted", drive.device))
        })?;

        let scan = self.scan(root)?;
        tracing::info!(
            "Assessed {}: {} files, {} bytes, {} samples, {} issues",
            drive.device,
            scan.total_files,
            scan.total_size,
            scan.samples.len(),
            scan.issues.len()
        );

        let estimated_duration_hours =
            scan.total_size as f64 / self.throughput_bytes_per_sec as f64 / 3600.0;
        let space_required_bytes = space_required(scan.total_size);
        let recommendations = recommendations(
            scan.total_size,
            estimated_duration_hours,
            scan.issues.len(),
            space_required_bytes,
        );

        Ok(MigrationAssessment {
            source: drive.clone(),
            total_files: scan.total_files,
            total_size_bytes: scan.total_size,
            estimated_duration_hours,
            space_required_bytes,
            compatibility_issues: scan.issues,
            integrity_samples: scan.samples,
            recommendations,
        })
    }

    fn scan(&self, root: &Path) -> Result<Scan, FerryError> {
        let root_metadata = std::fs::metadata(root).map_err(|e| {
            FerryError::execution("assessment", format!("cannot read {}: {}", root.display(), e))
        })?;
        if !root_metadata.is_dir() {
            return Err(FerryError::execution(
                "assessment",
                format!("{} is not a directory", root.display()),
            ));
        }

        let mut scan = Scan::default();
        let mut flagged: HashSet<PathBuf> = HashSet::new();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_excluded_name(entry.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(FerryError::execution(
                        "assessment",
                        format!("cannot walk {}: {}", root.display(), e),
                    ));
                }
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    tracing::warn!("Skipping unreadable entry {}: {}", path, e);
                    scan.issues.push(format!("{}: unreadable ({})", path, e));
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    scan.issues
                        .push(format!("{}: unreadable ({})", entry.path().display(), e));
                    continue;
                }
            };

            scan.total_files += 1;
            scan.total_size += metadata.len();

            if let Some(ext) = incompatible_extension(entry.path()) {
                if flagged.insert(entry.path().to_path_buf()) {
                    scan.issues.push(format!(
                        "{}: Windows-only file type (.{}) will not run on the target system",
                        entry.path().display(),
                        ext
                    ));
                }
            }

            if (scan.total_files - 1) % self.sample_stride as u64 == 0 {
                match self.sample(entry.path(), &metadata) {
                    Ok(sample) => scan.samples.push(sample),
                    Err(e) => scan.issues.push(format!(
                        "{}: could not record integrity sample ({})",
                        entry.path().display(),
                        e
                    )),
                }
            }
        }

        Ok(scan)
    }

    fn sample(
        &self,
        path: &Path,
        metadata: &std::fs::Metadata,
    ) -> std::io::Result<FileIntegritySample> {
        let checksum = if metadata.len() > self.checksum_size_limit {
            String::new()
        } else {
            sha256_file(path)?
        };
        let modified: DateTime<Utc> = metadata.modified()?.into();

        Ok(FileIntegritySample {
            path: path.to_path_buf(),
            size: metadata.len(),
            checksum,
            modified,
        })
    }
}

#[derive(Default)]
struct Scan {
    total_files: u64,
    total_size: u64,
    issues: Vec<String>,
    samples: Vec<FileIntegritySample>,
}

fn incompatible_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    INCOMPATIBLE_EXTENSIONS
        .contains(&ext.as_str())
        .then_some(ext)
}

fn recommendations(
    total_size: u64,
    hours: f64,
    issue_count: usize,
    space_required_bytes: u64,
) -> Vec<String> {
    let mut out = Vec::new();

    if total_size > LARGE_DATASET_BYTES {
        out.push(format!(
            "Large dataset ({}): run the migration during a quiet period, the source drive will be under sustained load",
            format_bytes(total_size)
        ));
    }
    if hours > LONG_DURATION_HOURS {
        out.push(format!(
            "Estimated duration is {:.1} hours: keep the server powered and avoid heavy writes to the source",
            hours
        ));
    }
    if issue_count > 0 {
        out.push(format!(
            "{} compatibility issue(s) found: review Windows-specific and unreadable files before starting",
            issue_count
        ));
    }
    out.push(format!(
        "Target drives need at least {} of free space (data size plus 20%)",
        format_bytes(space_required_bytes)
    ));
    out.push("Back up important data before starting the migration".to_string());

    out
}
