use super::fstab;
use super::steps::restore_configuration;
use super::MigrationManager;
use crate::model::MigrationStatus;
use crate::{DriveInfo, FerryError};

impl MigrationManager {
    /// Undo a finished or failed migration.
    ///
    /// Restores the saved fstab and mount units, re-mounts the source at its
    /// original mount point and unmounts the targets. Target unmount
    /// failures are only logged. The record always ends `RolledBack`; a
    /// failed restore or remount is kept in `error_message` and returned.
    /// Holds the run lock throughout, so it never overlaps a live run or
    /// another rollback, in this process or any other.
    pub async fn rollback(&self, id: &str) -> Result<(), FerryError> {
        self.get(id).await?;
        let _lock = self.claim(id)?.ok_or_else(|| self.busy(id))?;
        let record = self.refresh(id).await?;
        if !record.rollback_available {
            return Err(FerryError::RollbackUnavailable(id.to_string()));
        }
        if record.status == MigrationStatus::InProgress {
            return Err(FerryError::WrongState {
                id: id.to_string(),
                actual: record.status,
                expected: MigrationStatus::Failed,
            });
        }
        tracing::info!(migration_id = id, "Rolling back");
        let mut problems = Vec::new();

        if let Err(e) = restore_configuration(&self.work_dir.backup_dir(id)) {
            tracing::error!(migration_id = id, "Restoring configuration failed: {}", e);
            problems.push(format!("restore configuration: {}", e));
        }

        match self.work_dir.load_metadata(id) {
            Ok(metadata) => {
                if let Err(e) = self.remount_source(&metadata.source).await {
                    tracing::error!(migration_id = id, "Re-mounting source failed: {}", e);
                    problems.push(format!("remount source: {}", e));
                }
            }
            Err(e) => problems.push(format!("remount source: {}", e)),
        }

        for device in &record.target_devices {
            match self.command(&["umount", device.as_str()]).await {
                Ok(output) if output.success => {
                    tracing::info!(migration_id = id, "Unmounted {}", device)
                }
                Ok(output) => tracing::warn!(
                    migration_id = id,
                    "Unmounting {} failed: {}",
                    device,
                    output.stderr.trim()
                ),
                Err(e) => tracing::warn!(migration_id = id, "Unmounting {} failed: {}", device, e),
            }
        }

        let summary = if problems.is_empty() {
            None
        } else {
            Some(format!("rollback incomplete: {}", problems.join("; ")))
        };
        let marked = self
            .store
            .update(id, |record| record.mark_rolled_back(summary.clone()))
            .await
            .and_then(|result| result);
        marked?;
        self.store.release_targets(id).await;
        self.persist(id).await;

        match summary {
            None => {
                tracing::info!(migration_id = id, "Rolled back");
                Ok(())
            }
            Some(message) => Err(FerryError::execution("rollback", message)),
        }
    }

    async fn remount_source(&self, source: &DriveInfo) -> Result<(), FerryError> {
        let Some(mount_point) = &source.mount_point else {
            return Ok(());
        };

        match std::fs::read_to_string(&self.config.mount_table_path) {
            Ok(table) if fstab::is_mounted_at(&table, &source.device, mount_point) => {
                tracing::info!(
                    "{} is already mounted at {}",
                    source.device,
                    mount_point.display()
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                "Cannot read mount table {}: {}",
                self.config.mount_table_path.display(),
                e
            ),
        }

        let mount_arg = mount_point.to_string_lossy();
        self.command(&["mkdir", "-p", mount_arg.as_ref()])
            .await?
            .check("remount source")?;
        self.runner
            .mount(
                &source.device,
                mount_point,
                Some(&self.config.source_mount_fstype),
                None,
            )
            .await?
            .check("remount source")?;
        tracing::info!("Re-mounted {} at {}", source.device, mount_point.display());
        Ok(())
    }
}
