//! Migration orchestration.
//!
//! [`MigrationManager`] owns the record store and the collaborators a run
//! needs, and drives each migration through
//! backup → prepare targets → copy → verify → update configuration.
//! Rollback lives in [`rollback`], the individual steps in [`steps`].

pub mod fstab;
mod rollback;
pub mod steps;

use crate::assessment::AssessmentEngine;
use crate::command::{CommandOutput, CommandRunner};
use crate::copy::{CopyTool, RsyncCopyTool};
use crate::lock::RunLock;
use crate::model::{MigrationMetadata, MigrationRecord, MigrationStatus};
use crate::monitor::{
    progress_snapshot, running_health, HealthReport, HealthStatus, ProgressSnapshot, SpaceProbe,
    TargetSpace,
};
use crate::persistence::{validate_migration_id, WorkDir};
use crate::report::{self, MigrationReport, MigrationStatistics};
use crate::store::MigrationStore;
use crate::verify::VerificationOutcome;
use crate::{DriveDiscovery, DriveInfo, FerryError, MigrationConfig};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

pub use steps::BackupManifest;

pub struct MigrationManager {
    config: MigrationConfig,
    work_dir: WorkDir,
    store: MigrationStore,
    discovery: Arc<dyn DriveDiscovery>,
    runner: Arc<dyn CommandRunner>,
    copier: Arc<dyn CopyTool>,
    space: Arc<dyn SpaceProbe>,
    /// Serializes the Ready → InProgress check-and-claim.
    start_lock: tokio::sync::Mutex<()>,
    /// Run locks of the migrations this manager is running.
    run_locks: std::sync::Mutex<HashMap<String, RunLock>>,
}

impl MigrationManager {
    /// Build a manager that copies with rsync. Validates the config and
    /// creates the work directory.
    pub fn new(
        config: MigrationConfig,
        discovery: Arc<dyn DriveDiscovery>,
        runner: Arc<dyn CommandRunner>,
        space: Arc<dyn SpaceProbe>,
    ) -> Result<Self, FerryError> {
        config.validate()?;
        let work_dir = WorkDir::new(config.work_dir.clone());
        work_dir.ensure()?;

        Ok(Self {
            config,
            work_dir,
            store: MigrationStore::new(),
            discovery,
            runner,
            copier: Arc::new(RsyncCopyTool::new()),
            space,
            start_lock: tokio::sync::Mutex::new(()),
            run_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn with_copy_tool(mut self, copier: Arc<dyn CopyTool>) -> Self {
        self.copier = copier;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    /// Reload record snapshots from the work directory. Read-only: nothing
    /// on disk changes, so it is safe while another process runs a
    /// migration from the same work directory.
    pub async fn load_persisted(&self) -> Result<usize, FerryError> {
        let records = self.work_dir.load_records()?;
        let count = records.len();
        for record in records {
            self.store.put(record).await;
        }
        Ok(count)
    }

    /// Mark failed every in-progress record whose run lock is free, i.e.
    /// whose run died with its process, so it can be rolled back. Records
    /// still locked by a live run are left alone. Returns the ids marked.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, FerryError> {
        let mut recovered = Vec::new();

        for record in self.store.list().await {
            if record.status != MigrationStatus::InProgress {
                continue;
            }
            let id = record.migration_id.as_str();
            let Some(_lock) = self.claim(id)? else {
                tracing::debug!(migration_id = id, "Run is live in another process");
                continue;
            };
            // The owner may have finished between the listing and the claim.
            if self.refresh(id).await?.status != MigrationStatus::InProgress {
                continue;
            }

            tracing::warn!(migration_id = id, "Run was interrupted, marking failed");
            self.store
                .update(id, |record| {
                    record.mark_failed("interrupted: the process stopped while the migration was running")
                })
                .await??;
            if let Some(record) = self.store.get(id).await {
                self.work_dir.save_record(&record)?;
            }
            recovered.push(id.to_string());
        }
        Ok(recovered)
    }

    /// Validate the request, assess the source and store a `Ready` record.
    /// Nothing is stored when any check or the assessment fails.
    pub async fn create_plan(
        &self,
        source: &str,
        targets: &[String],
        migration_id: Option<String>,
    ) -> Result<String, FerryError> {
        if targets.is_empty() {
            return Err(FerryError::InvalidInput("at least one target is required".to_string()));
        }
        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.as_str()) {
                return Err(FerryError::InvalidInput(format!("target {} listed twice", target)));
            }
            if target == source {
                return Err(FerryError::InvalidInput(format!(
                    "{} cannot be both source and target",
                    source
                )));
            }
        }

        let id = match migration_id {
            Some(id) => {
                validate_migration_id(&id)?;
                if self.store.contains(&id).await || self.work_dir.metadata_path(&id).exists() {
                    return Err(FerryError::DuplicateId(id));
                }
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let drives = self.discovery.discover_drives().await?;
        let find = |device: &str| -> Result<DriveInfo, FerryError> {
            drives
                .iter()
                .find(|d| d.device == device)
                .cloned()
                .ok_or_else(|| FerryError::DeviceNotFound(device.to_string()))
        };
        let source_drive = find(source)?;
        let target_drives = targets
            .iter()
            .map(|t| find(t.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut record = MigrationRecord::new(&id, source, targets.to_vec());
        record.transition(MigrationStatus::Analyzing)?;
        tracing::info!(migration_id = %id, "Assessing {}", source);

        let engine = AssessmentEngine::new(&self.config);
        let drive = source_drive.clone();
        let assessment = tokio::task::spawn_blocking(move || engine.assess(&drive))
            .await
            .map_err(|e| FerryError::Assessment(Box::new(FerryError::TaskFailed(e.to_string()))))?
            .map_err(|e| FerryError::Assessment(Box::new(e)))?;

        record.set_totals(assessment.total_files, assessment.total_size_bytes);
        record.transition(MigrationStatus::Ready)?;

        let metadata = MigrationMetadata {
            migration_id: id.clone(),
            created_at: Utc::now(),
            source: source_drive,
            targets: target_drives,
            target_filesystem: self.config.target_filesystem.clone(),
            assessment,
        };

        self.store.insert_new(record.clone()).await?;
        let saved = self
            .work_dir
            .save_metadata(&metadata)
            .and_then(|_| self.work_dir.save_record(&record));
        if let Err(e) = saved {
            self.store.remove(&id).await;
            let _ = self.work_dir.remove(&id, false);
            return Err(e);
        }

        tracing::info!(
            migration_id = %id,
            "Plan ready: {} files, {} bytes",
            record.total_files,
            record.total_bytes
        );
        Ok(id)
    }

    /// Launch the migration on its own task and return immediately.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<(), FerryError> {
        self.begin(id).await?;
        let manager = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            manager.run(&id).await;
        });
        Ok(())
    }

    /// Run the migration to completion on the current task and return its
    /// final status.
    pub async fn execute(&self, id: &str) -> Result<MigrationStatus, FerryError> {
        self.begin(id).await?;
        Ok(self.run(id).await)
    }

    /// Ready → InProgress, claiming the run lock and the targets.
    async fn begin(&self, id: &str) -> Result<(), FerryError> {
        let _guard = self.start_lock.lock().await;

        self.get(id).await?;
        let lock = self.claim(id)?.ok_or_else(|| self.busy(id))?;
        let record = self.refresh(id).await?;
        if record.status != MigrationStatus::Ready {
            return Err(FerryError::WrongState {
                id: id.to_string(),
                actual: record.status,
                expected: MigrationStatus::Ready,
            });
        }

        self.store.reserve_targets(id, &record.target_devices).await?;
        let started = self
            .store
            .update(id, |record| record.mark_started())
            .await
            .and_then(|result| result);
        if let Err(e) = started {
            self.store.release_targets(id).await;
            return Err(e);
        }
        self.persist(id).await;
        self.lock_table().insert(id.to_string(), lock);
        Ok(())
    }

    async fn run(&self, id: &str) -> MigrationStatus {
        let span = tracing::info_span!("migration", migration_id = %id);
        async {
            let result = self.run_steps(id).await;
            let finished = self
                .store
                .update(id, |record| {
                    match &result {
                        Ok(()) => record.mark_completed()?,
                        Err(e) => record.mark_failed(e.to_string())?,
                    }
                    Ok::<_, FerryError>(record.status)
                })
                .await
                .and_then(|result| result);

            self.store.release_targets(id).await;
            self.persist(id).await;
            self.lock_table().remove(id);

            match (&result, finished) {
                (_, Err(e)) => {
                    tracing::error!("Could not record the outcome: {}", e);
                    MigrationStatus::Failed
                }
                (Ok(()), Ok(status)) => {
                    tracing::info!("Migration completed");
                    status
                }
                (Err(e), Ok(status)) => {
                    tracing::error!("Migration failed: {}", e);
                    status
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_steps(&self, id: &str) -> Result<(), FerryError> {
        let metadata = self.work_dir.load_metadata(id)?;
        let source_root = metadata.source.mount_point.clone().ok_or_else(|| {
            FerryError::InvalidInput(format!("source {} has no mount point", metadata.source.device))
        })?;

        tracing::info!("Step 1/5: {}", steps::STEP_BACKUP);
        steps::backup_configuration(&self.config, id, &self.work_dir.backup_dir(id))?;

        tracing::info!("Step 2/5: {}", steps::STEP_PREPARE);
        let mount_points = self.prepare_targets(&metadata).await?;
        let primary = mount_points
            .first()
            .cloned()
            .ok_or_else(|| FerryError::InvalidInput("plan has no targets".to_string()))?;

        tracing::info!("Step 3/5: {} to {}", steps::STEP_COPY, primary.display());
        self.copy_data(id, &source_root, &primary).await?;

        tracing::info!("Step 4/5: {}", steps::STEP_VERIFY);
        self.verify_copy(&source_root, &primary, &metadata.assessment.integrity_samples)
            .await?;

        tracing::info!("Step 5/5: {}", steps::STEP_UPDATE);
        self.update_configuration(&metadata, &mount_points).await
    }

    pub async fn get(&self, id: &str) -> Result<MigrationRecord, FerryError> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| FerryError::NotFound(id.to_string()))
    }

    pub fn metadata(&self, id: &str) -> Result<MigrationMetadata, FerryError> {
        self.work_dir.load_metadata(id)
    }

    pub async fn list(&self) -> Vec<MigrationRecord> {
        self.store.list().await
    }

    pub async fn progress(&self, id: &str) -> Result<ProgressSnapshot, FerryError> {
        let record = self.get(id).await?;
        Ok(progress_snapshot(&record, Utc::now()))
    }

    pub async fn health(&self, id: &str) -> Result<HealthReport, FerryError> {
        let record = self.get(id).await?;

        let (status, issues) = match record.status {
            MigrationStatus::InProgress => {
                let targets = self.target_space(id);
                running_health(&record, Utc::now(), &targets)
            }
            MigrationStatus::Failed => (
                HealthStatus::Failed,
                vec![record
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string())],
            ),
            MigrationStatus::Completed => {
                let outcome = self.validate_completed(id).await?;
                if outcome.passed {
                    (HealthStatus::Completed, Vec::new())
                } else {
                    (HealthStatus::CompletedWithIssues, outcome.errors)
                }
            }
            MigrationStatus::RolledBack => (HealthStatus::RolledBack, Vec::new()),
            MigrationStatus::Pending | MigrationStatus::Analyzing | MigrationStatus::Ready => {
                (HealthStatus::Idle, Vec::new())
            }
        };

        Ok(HealthReport {
            migration_id: id.to_string(),
            status,
            issues,
            checked_at: Utc::now(),
        })
    }

    fn target_space(&self, id: &str) -> Vec<TargetSpace> {
        let metadata = match self.work_dir.load_metadata(id) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(migration_id = id, "No metadata for space checks: {}", e);
                return Vec::new();
            }
        };
        metadata
            .targets
            .iter()
            .map(|target| {
                let mount_point = self.target_mount_point(target);
                let reading = self.space.free_space(&mount_point);
                TargetSpace {
                    mount_point,
                    reading,
                }
            })
            .collect()
    }

    /// Re-check the recorded samples against the primary target.
    async fn validate_completed(&self, id: &str) -> Result<VerificationOutcome, FerryError> {
        let metadata = self.work_dir.load_metadata(id)?;
        let (source_root, target_root) = self.copy_roots(&metadata)?;
        steps::run_verification(
            &source_root,
            &target_root,
            &metadata.assessment.integrity_samples,
        )
        .await
    }

    fn copy_roots(&self, metadata: &MigrationMetadata) -> Result<(PathBuf, PathBuf), FerryError> {
        let source_root = metadata.source.mount_point.clone().ok_or_else(|| {
            FerryError::InvalidInput(format!("source {} has no mount point", metadata.source.device))
        })?;
        let target_root = metadata
            .primary_target()
            .map(|target| self.target_mount_point(target))
            .ok_or_else(|| FerryError::InvalidInput("plan has no targets".to_string()))?;
        Ok((source_root, target_root))
    }

    pub async fn report(&self, id: &str) -> Result<MigrationReport, FerryError> {
        let record = self.get(id).await?;
        let metadata = match self.work_dir.load_metadata(id) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(migration_id = id, "Reporting without metadata: {}", e);
                None
            }
        };
        let validation = match (&metadata, record.status) {
            (Some(_), MigrationStatus::Completed) => Some(self.validate_completed(id).await?),
            _ => None,
        };
        Ok(MigrationReport::build(&record, metadata.as_ref(), validation, Utc::now()))
    }

    pub async fn statistics(&self) -> MigrationStatistics {
        report::statistics(&self.store.list().await)
    }

    /// Forget a migration. Its metadata and progress files are deleted; the
    /// configuration backup only when `remove_backup` is set.
    pub async fn cleanup(&self, id: &str, remove_backup: bool) -> Result<(), FerryError> {
        self.get(id).await?;
        let lock = self.claim(id)?.ok_or_else(|| self.busy(id))?;
        let record = self.refresh(id).await?;
        if record.status == MigrationStatus::InProgress {
            return Err(FerryError::WrongState {
                id: id.to_string(),
                actual: record.status,
                expected: MigrationStatus::Completed,
            });
        }
        self.store.remove(id).await;
        drop(lock);
        self.work_dir.remove(id, remove_backup)?;
        tracing::info!(migration_id = id, "Cleaned up (backup removed: {})", remove_backup);
        Ok(())
    }

    /// Take the cross-process lock for `id`; `None` while another run or
    /// rollback holds it.
    fn claim(&self, id: &str) -> Result<Option<RunLock>, FerryError> {
        RunLock::try_acquire(&self.work_dir.lock_path(id))
    }

    fn busy(&self, id: &str) -> FerryError {
        FerryError::MigrationBusy {
            id: id.to_string(),
            owner: RunLock::owner(&self.work_dir.lock_path(id)),
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunLock>> {
        self.run_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the in-memory record with the on-disk snapshot. Only called
    /// while holding the run lock, when no run can be ahead of the snapshot.
    async fn refresh(&self, id: &str) -> Result<MigrationRecord, FerryError> {
        match self.work_dir.load_record(id)? {
            Some(record) => {
                self.store.put(record.clone()).await;
                Ok(record)
            }
            None => self.get(id).await,
        }
    }

    async fn persist(&self, id: &str) {
        let Some(record) = self.store.get(id).await else {
            return;
        };
        if let Err(e) = self.work_dir.save_record(&record) {
            tracing::warn!(migration_id = id, "Could not save progress snapshot: {}", e);
        }
    }

    async fn command(&self, argv: &[&str]) -> Result<CommandOutput, FerryError> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        self.runner.run_command(&argv).await
    }
}
