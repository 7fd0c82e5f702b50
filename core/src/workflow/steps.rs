//! The five workflow steps and the configuration backup they start with.

use super::fstab::{self, FstabEntry};
use super::MigrationManager;
use crate::assessment::EXCLUDED_NAME_FRAGMENTS;
use crate::copy::CopyRequest;
use crate::model::{FileIntegritySample, MigrationMetadata};
use crate::persistence::{read_json, write_atomic, write_json_atomic};
use crate::progress::{ProgressEvent, ProgressParser};
use crate::safety::FormatGuard;
use crate::verify::verify_samples;
use crate::{DriveInfo, FerryError, MigrationConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STEP_BACKUP: &str = "backup configuration";
pub const STEP_PREPARE: &str = "prepare targets";
pub const STEP_COPY: &str = "copy data";
pub const STEP_VERIFY: &str = "verify";
pub const STEP_UPDATE: &str = "update configuration";

const MANIFEST_FILE: &str = "manifest.json";
const FSTAB_COPY: &str = "fstab";
const UNITS_DIR: &str = "units";
const MOUNTS_COPY: &str = "mounts";

/// What was saved before the run, and from where.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupManifest {
    pub migration_id: String,
    pub created_at: DateTime<Utc>,
    pub fstab_path: PathBuf,
    /// False when there was no fstab to save; restore then removes any
    /// fstab the run created.
    pub fstab_saved: bool,
    pub mount_unit_dir: PathBuf,
    pub mount_units: Vec<String>,
    pub mount_table_saved: bool,
}

pub fn backup_configuration(
    config: &MigrationConfig,
    migration_id: &str,
    backup_dir: &Path,
) -> Result<BackupManifest, FerryError> {
    let units_dir = backup_dir.join(UNITS_DIR);
    std::fs::create_dir_all(&units_dir).map_err(|e| FerryError::persistence(&units_dir, e))?;

    let fstab_saved = copy_if_present(&config.fstab_path, &backup_dir.join(FSTAB_COPY))?;
    let mount_table_saved =
        copy_if_present(&config.mount_table_path, &backup_dir.join(MOUNTS_COPY))?;

    let mut mount_units = Vec::new();
    match std::fs::read_dir(&config.mount_unit_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.map_err(|e| FerryError::persistence(&config.mount_unit_dir, e))?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.ends_with(".mount") || !entry.path().is_file() {
                    continue;
                }
                let dest = units_dir.join(&name);
                std::fs::copy(entry.path(), &dest).map_err(|e| FerryError::persistence(&dest, e))?;
                mount_units.push(name);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(FerryError::persistence(&config.mount_unit_dir, e)),
    }
    mount_units.sort();

    let manifest = BackupManifest {
        migration_id: migration_id.to_string(),
        created_at: Utc::now(),
        fstab_path: config.fstab_path.clone(),
        fstab_saved,
        mount_unit_dir: config.mount_unit_dir.clone(),
        mount_units,
        mount_table_saved,
    };
    write_json_atomic(&backup_dir.join(MANIFEST_FILE), &manifest)?;
    tracing::info!(
        migration_id,
        "Backed up configuration to {} ({} mount units)",
        backup_dir.display(),
        manifest.mount_units.len()
    );
    Ok(manifest)
}

/// Put the saved fstab and mount units back where the manifest says they
/// came from.
pub fn restore_configuration(backup_dir: &Path) -> Result<BackupManifest, FerryError> {
    let manifest: BackupManifest = read_json(&backup_dir.join(MANIFEST_FILE))?;

    if manifest.fstab_saved {
        let saved = backup_dir.join(FSTAB_COPY);
        let content = std::fs::read(&saved).map_err(|e| FerryError::persistence(&saved, e))?;
        write_atomic(&manifest.fstab_path, &content)?;
    } else {
        match std::fs::remove_file(&manifest.fstab_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FerryError::persistence(&manifest.fstab_path, e)),
        }
    }

    for unit in &manifest.mount_units {
        let saved = backup_dir.join(UNITS_DIR).join(unit);
        let content = std::fs::read(&saved).map_err(|e| FerryError::persistence(&saved, e))?;
        write_atomic(&manifest.mount_unit_dir.join(unit), &content)?;
    }
    Ok(manifest)
}

fn copy_if_present(from: &Path, to: &Path) -> Result<bool, FerryError> {
    match std::fs::read(from) {
        Ok(content) => {
            write_atomic(to, &content)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FerryError::persistence(from, e)),
    }
}

impl MigrationManager {
    pub(super) fn target_mount_point(&self, target: &DriveInfo) -> PathBuf {
        target
            .mount_point
            .clone()
            .unwrap_or_else(|| self.config.mount_root.join(target.short_name()))
    }

    /// Format and mount every target that needs it. Returns the mount point
    /// of each target, in plan order.
    pub(super) async fn prepare_targets(
        &self,
        metadata: &MigrationMetadata,
    ) -> Result<Vec<PathBuf>, FerryError> {
        let id = metadata.migration_id.as_str();
        let fstype = metadata.target_filesystem.as_str();
        let guard = FormatGuard::new(id, &metadata.source);
        let mut mount_points = Vec::with_capacity(metadata.targets.len());

        for target in &metadata.targets {
            let mount_point = self.target_mount_point(target);

            if !target.has_filesystem(fstype) {
                let approval = guard.approve(target)?;
                if target.mount_point.is_some() {
                    tracing::info!(migration_id = id, "Unmounting {}", target.device);
                    self.command(&["umount", target.device.as_str()]).await?.check(STEP_PREPARE)?;
                }
                tracing::info!(migration_id = id, "Formatting {} as {}", target.device, fstype);
                self.runner
                    .format(&approval, fstype, target.label.as_deref())
                    .await?
                    .check(STEP_PREPARE)?;
                self.mount_target(target, &mount_point, fstype).await?;
            } else if target.mount_point.is_none() {
                self.mount_target(target, &mount_point, fstype).await?;
            } else {
                tracing::debug!(migration_id = id, "{} already prepared", target.device);
            }
            mount_points.push(mount_point);
        }
        Ok(mount_points)
    }

    async fn mount_target(
        &self,
        target: &DriveInfo,
        mount_point: &Path,
        fstype: &str,
    ) -> Result<(), FerryError> {
        let mount_arg = mount_point.to_string_lossy();
        self.command(&["mkdir", "-p", mount_arg.as_ref()]).await?.check(STEP_PREPARE)?;
        tracing::info!("Mounting {} at {}", target.device, mount_point.display());
        self.runner
            .mount(
                &target.device,
                mount_point,
                Some(fstype),
                Some(&self.config.target_mount_options),
            )
            .await?
            .check(STEP_PREPARE)?;
        Ok(())
    }

    /// Run the copy tool and feed its output into the record while it runs.
    pub(super) async fn copy_data(
        &self,
        id: &str,
        source_root: &Path,
        target_root: &Path,
    ) -> Result<(), FerryError> {
        let request = CopyRequest {
            source: source_root.to_path_buf(),
            target: target_root.to_path_buf(),
            excludes: EXCLUDED_NAME_FRAGMENTS.iter().map(|s| s.to_string()).collect(),
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let copier = self.copier.clone();
        let copy = async move { copier.copy(&request, tx).await };
        let consume = async {
            let mut parser = ProgressParser::new();
            while let Some(line) = rx.recv().await {
                for event in parser.parse_line(&line) {
                    self.apply_progress(id, event).await;
                }
            }
        };

        let (result, ()) = tokio::join!(copy, consume);
        result
    }

    async fn apply_progress(&self, id: &str, event: ProgressEvent) {
        let applied = self
            .store
            .update(id, |record| match event {
                ProgressEvent::FilesDone { done, .. } => {
                    record.record_files_done(done);
                }
                ProgressEvent::BytesDone(bytes) => {
                    record.record_bytes_done(bytes);
                }
                ProgressEvent::TimeRemaining(remaining) => {
                    record.set_estimated_completion(remaining);
                }
            })
            .await;
        if let Err(e) = applied {
            tracing::warn!(migration_id = id, "Dropping progress update: {}", e);
        }
    }

    pub(super) async fn verify_copy(
        &self,
        source_root: &Path,
        target_root: &Path,
        samples: &[FileIntegritySample],
    ) -> Result<(), FerryError> {
        let outcome = run_verification(source_root, target_root, samples).await?;
        if outcome.passed {
            tracing::info!("Verified {} sampled files", outcome.samples_checked);
            Ok(())
        } else {
            Err(FerryError::Integrity(outcome.errors))
        }
    }

    /// Append fstab entries for the targets and disable the source's.
    pub(super) async fn update_configuration(
        &self,
        metadata: &MigrationMetadata,
        mount_points: &[PathBuf],
    ) -> Result<(), FerryError> {
        let id = metadata.migration_id.as_str();
        // Formatting gave the targets new UUIDs.
        let current = match self.discovery.discover_drives().await {
            Ok(drives) => drives,
            Err(e) => {
                tracing::warn!(migration_id = id, "Drive discovery failed, using device paths: {}", e);
                Vec::new()
            }
        };

        let entries: Vec<FstabEntry> = metadata
            .targets
            .iter()
            .zip(mount_points)
            .map(|(target, mount_point)| {
                let fresh = current
                    .iter()
                    .find(|d| d.device == target.device)
                    .and_then(|d| d.uuid.clone());
                let kept = if target.has_filesystem(&metadata.target_filesystem) {
                    target.uuid.clone()
                } else {
                    None
                };
                let spec = match fresh.or(kept) {
                    Some(uuid) => format!("UUID={}", uuid),
                    None => target.device.clone(),
                };
                FstabEntry {
                    spec,
                    mount_point: mount_point.clone(),
                    fstype: metadata.target_filesystem.clone(),
                    options: self.config.target_mount_options.clone(),
                }
            })
            .collect();

        let path = &self.config.fstab_path;
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(FerryError::persistence(path, e)),
        };
        let updated = fstab::rewrite(&content, id, &metadata.source, &entries);
        write_atomic(path, updated.as_bytes())?;
        tracing::info!(migration_id = id, "Updated {} with {} entries", path.display(), entries.len());
        Ok(())
    }
}

pub(super) async fn run_verification(
    source_root: &Path,
    target_root: &Path,
    samples: &[FileIntegritySample],
) -> Result<crate::verify::VerificationOutcome, FerryError> {
    let source_root = source_root.to_path_buf();
    let target_root = target_root.to_path_buf();
    let samples = samples.to_vec();
    tokio::task::spawn_blocking(move || verify_samples(&source_root, &target_root, &samples))
        .await
        .map_err(|e| FerryError::TaskFailed(e.to_string()))
}
