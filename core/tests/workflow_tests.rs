/// End-to-end workflow tests against mock collaborators.
/// Every path the manager touches lives under a temporary directory.

#[cfg(test)]
mod workflow_tests {
    use ferry_core::lock::RunLock;
    use ferry_core::test_utils::{
        mock_drive, FixedSpaceProbe, MockCommandRunner, MockCopyTool, MockDriveDiscovery,
    };
    use ferry_core::{
        CopyRequest, CopyTool, ErrorKind, FerryError, HealthStatus, MigrationConfig,
        MigrationManager, MigrationStatus,
    };
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::sync::Notify;

    const SOURCE: &str = "/dev/sdb1";
    const TARGET: &str = "/dev/sdc1";

    struct Harness {
        _dir: TempDir,
        config: MigrationConfig,
        source_root: PathBuf,
        original_fstab: String,
        discovery: Arc<MockDriveDiscovery>,
        runner: Arc<MockCommandRunner>,
        manager: Arc<MigrationManager>,
    }

    impl Harness {
        fn target_root(&self) -> PathBuf {
            self.config.mount_root.join("sdc1")
        }

        fn fstab(&self) -> String {
            std::fs::read_to_string(&self.config.fstab_path).unwrap()
        }
    }

    /// 100 small files plus a `Thumbs.db` that must be left behind.
    fn populate_source(root: &Path) {
        for i in 0..100 {
            let dir = root.join(format!("album_{}", i / 25));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(format!("photo_{:03}.jpg", i)), format!("photo {} ", i).repeat(i + 1))
                .unwrap();
        }
        std::fs::write(root.join("album_0").join("Thumbs.db"), b"cache").unwrap();
    }

    fn harness_with(copier: Arc<dyn CopyTool>, space: FixedSpaceProbe) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MigrationConfig::sandboxed(dir.path());
        config.sample_stride = 10;

        let source_root = dir.path().join("source");
        populate_source(&source_root);

        let original_fstab = format!(
            "UUID=root / ext4 errors=remount-ro 0 1\nUUID=uuid-sdb1 {} ntfs3 defaults 0 0\n",
            source_root.display()
        );
        std::fs::create_dir_all(config.fstab_path.parent().unwrap()).unwrap();
        std::fs::write(&config.fstab_path, &original_fstab).unwrap();

        let discovery = Arc::new(MockDriveDiscovery::new(vec![
            mock_drive(SOURCE, "ntfs", Some(source_root.as_path())),
            mock_drive(TARGET, "vfat", None),
            mock_drive("/dev/sdd1", "ext4", Some(Path::new("/srv/parity"))),
        ]));
        let runner = Arc::new(MockCommandRunner::new());
        let manager = MigrationManager::new(
            config.clone(),
            discovery.clone(),
            runner.clone(),
            Arc::new(space),
        )
        .unwrap()
        .with_copy_tool(copier);

        Harness {
            _dir: dir,
            config,
            source_root,
            original_fstab,
            discovery,
            runner,
            manager: Arc::new(manager),
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MockCopyTool::new()), FixedSpaceProbe::new(50))
    }

    /// Waits for a signal before reporting success without copying anything.
    struct GatedCopyTool {
        gate: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl CopyTool for GatedCopyTool {
        async fn copy(
            &self,
            _request: &CopyRequest,
            lines: UnboundedSender<String>,
        ) -> Result<(), FerryError> {
            let _ = lines.send("     1,000  10%  1.00MB/s  0:00:09 (xfr#10, to-chk=90/100)".to_string());
            self.gate.notified().await;
            Ok(())
        }
    }

    async fn wait_until_finished(manager: &MigrationManager, id: &str) -> MigrationStatus {
        for _ in 0..500 {
            let status = manager.get(id).await.unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("migration {} did not finish", id);
    }

    #[tokio::test]
    async fn test_plan_assesses_source() {
        let h = harness();
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("plan-1".to_string()))
            .await
            .unwrap();
        assert_eq!(id, "plan-1");

        let record = h.manager.get(&id).await.unwrap();
        assert_eq!(record.status, MigrationStatus::Ready);
        assert_eq!(record.total_files, 100);
        assert!(!record.rollback_available);

        let metadata = h.manager.metadata(&id).unwrap();
        assert_eq!(metadata.assessment.total_files, 100);
        assert_eq!(metadata.assessment.integrity_samples.len(), 10);
        assert_eq!(metadata.targets[0].device, TARGET);
    }

    #[tokio::test]
    async fn test_successful_migration_completes() {
        let h = harness();
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        h.discovery
            .update_drive(TARGET, |d| d.uuid = Some("fresh-uuid".to_string()));

        let status = h.manager.execute(&id).await.unwrap();
        assert_eq!(status, MigrationStatus::Completed);

        let record = h.manager.get(&id).await.unwrap();
        assert_eq!(record.file_ratio(), 1.0);
        assert_eq!(record.files_migrated, 100);
        assert!(record.completed_at.is_some());
        assert!(record.rollback_available);

        // Only the target was formatted.
        assert_eq!(h.runner.formatted_devices(), vec![TARGET.to_string()]);

        let target_root = h.target_root();
        assert!(target_root.join("album_3").join("photo_099.jpg").exists());
        assert!(!target_root.join("album_0").join("Thumbs.db").exists());

        let fstab = h.fstab();
        assert!(fstab.contains(&format!("# ferry {} disabled: UUID=uuid-sdb1", id)));
        assert!(fstab.contains(&format!(
            "UUID=fresh-uuid {} ext4 defaults,nofail 0 2",
            target_root.display()
        )));
        assert!(h
            .manager
            .work_dir()
            .backup_dir(&id)
            .join("manifest.json")
            .exists());

        let health = h.manager.health(&id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Completed);

        let report = h.manager.report(&id).await.unwrap();
        let validation = report.validation.as_ref().unwrap();
        assert!(validation.passed);
        assert_eq!(validation.samples_checked, 10);
        assert!(report.to_string().contains("Validation:  passed"));

        let progress = h.manager.progress(&id).await.unwrap();
        assert_eq!(progress.files_percent, 100.0);
    }

    #[tokio::test]
    async fn test_copy_failure_leaves_configuration_untouched() {
        let h = harness_with(
            Arc::new(MockCopyTool::failing("rsync: connection unexpectedly closed")),
            FixedSpaceProbe::new(50),
        );
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();

        let status = h.manager.execute(&id).await.unwrap();
        assert_eq!(status, MigrationStatus::Failed);

        let record = h.manager.get(&id).await.unwrap();
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("connection unexpectedly closed"));
        assert!(record.rollback_available);
        assert_eq!(h.fstab(), h.original_fstab);

        let health = h.manager.health(&id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Failed);
        assert!(health.issues[0].contains("connection unexpectedly closed"));
    }

    #[tokio::test]
    async fn test_rollback_restores_and_remounts_source() {
        let h = harness_with(
            Arc::new(MockCopyTool::failing("disk full")),
            FixedSpaceProbe::new(50),
        );
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        h.manager.execute(&id).await.unwrap();

        // Simulate a configuration change the run left behind.
        std::fs::write(&h.config.fstab_path, "garbage\n").unwrap();

        h.manager.rollback(&id).await.unwrap();

        let record = h.manager.get(&id).await.unwrap();
        assert_eq!(record.status, MigrationStatus::RolledBack);
        assert!(!record.rollback_available);
        assert_eq!(h.fstab(), h.original_fstab);

        let source_root = h.source_root.display().to_string();
        assert!(h
            .runner
            .calls_to("mount")
            .iter()
            .any(|argv| argv.contains(&SOURCE.to_string())
                && argv.contains(&"ntfs3".to_string())
                && argv.contains(&source_root)));
        assert!(h
            .runner
            .calls_to("umount")
            .contains(&vec!["umount".to_string(), TARGET.to_string()]));

        let err = h.manager.rollback(&id).await.unwrap_err();
        assert!(matches!(err, FerryError::RollbackUnavailable(_)));
        assert_eq!(h.manager.health(&id).await.unwrap().status, HealthStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_of_completed_migration_restores_fstab() {
        let h = harness();
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        assert_eq!(h.manager.execute(&id).await.unwrap(), MigrationStatus::Completed);

        let migrated = h.fstab();
        assert!(migrated.contains(&format!("UUID=uuid-sdc1 {} ext4", h.target_root().display())));
        assert!(h.runner.calls_to("umount").is_empty());

        h.manager.rollback(&id).await.unwrap();

        assert_eq!(h.fstab(), h.original_fstab);
        assert_eq!(
            h.runner.calls_to("umount"),
            vec![vec!["umount".to_string(), TARGET.to_string()]]
        );
        let record = h.manager.get(&id).await.unwrap();
        assert_eq!(record.status, MigrationStatus::RolledBack);
        assert!(!record.rollback_available);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_rollback_skips_remount_when_source_is_mounted() {
        let h = harness_with(Arc::new(MockCopyTool::failing("boom")), FixedSpaceProbe::new(50));
        std::fs::write(
            &h.config.mount_table_path,
            format!("{} {} ntfs3 rw 0 0\n", SOURCE, h.source_root.display()),
        )
        .unwrap();
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        h.manager.execute(&id).await.unwrap();

        h.manager.rollback(&id).await.unwrap();
        assert!(!h
            .runner
            .calls_to("mount")
            .iter()
            .any(|argv| argv.contains(&SOURCE.to_string())));
    }

    #[tokio::test]
    async fn test_rollback_failure_still_ends_rolled_back() {
        let h = harness_with(Arc::new(MockCopyTool::failing("boom")), FixedSpaceProbe::new(50));
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        h.manager.execute(&id).await.unwrap();
        h.runner.fail_program("mount");
        h.runner.fail_program("umount");

        let err = h.manager.rollback(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);

        let record = h.manager.get(&id).await.unwrap();
        assert_eq!(record.status, MigrationStatus::RolledBack);
        assert!(!record.rollback_available);
        assert!(record.error_message.unwrap().contains("remount source"));
    }

    #[tokio::test]
    async fn test_invalid_plans_store_nothing() {
        let h = harness();

        let err = h
            .manager
            .create_plan(SOURCE, &[SOURCE.to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::InvalidInput(_)));

        let err = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string(), TARGET.to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::InvalidInput(_)));

        let err = h
            .manager
            .create_plan(SOURCE, &["/dev/sdz9".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::DeviceNotFound(_)));

        // An ext4 drive is not a valid source.
        let err = h
            .manager
            .create_plan("/dev/sdd1", &[TARGET.to_string()], Some("bad".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::Assessment(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert!(h.manager.list().await.is_empty());
        assert!(!h.manager.work_dir().metadata_path("bad").exists());
    }

    #[tokio::test]
    async fn test_start_requires_ready_plan() {
        let h = harness();
        assert!(matches!(
            h.manager.execute("missing").await,
            Err(FerryError::NotFound(_))
        ));

        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("once".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            h.manager
                .create_plan(SOURCE, &[TARGET.to_string()], Some("once".to_string()))
                .await,
            Err(FerryError::DuplicateId(_))
        ));

        h.manager.execute(&id).await.unwrap();
        let err = h.manager.execute(&id).await.unwrap_err();
        assert!(matches!(
            err,
            FerryError::WrongState { actual: MigrationStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn test_running_migration_reserves_targets_and_reports_health() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(
            Arc::new(GatedCopyTool { gate: gate.clone() }),
            FixedSpaceProbe::new(50),
        );
        let first = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("first".to_string()))
            .await
            .unwrap();
        let second = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("second".to_string()))
            .await
            .unwrap();

        h.manager.start(&first).await.unwrap();
        let err = h.manager.execute(&second).await.unwrap_err();
        assert!(matches!(err, FerryError::TargetInUse { ref migration_id, .. } if migration_id == "first"));
        assert_eq!(h.manager.get(&second).await.unwrap().status, MigrationStatus::Ready);

        // Wait for the first progress line to land.
        for _ in 0..500 {
            if h.manager.get(&first).await.unwrap().files_migrated > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let progress = h.manager.progress(&first).await.unwrap();
        assert_eq!(progress.status, MigrationStatus::InProgress);
        assert_eq!(progress.files_migrated, 10);
        assert!(progress.estimated_completion.is_some());

        let health = h.manager.health(&first).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy, "{:?}", health.issues);

        gate.notify_one();
        // Nothing was copied, so verification fails the run.
        assert_eq!(wait_until_finished(&h.manager, &first).await, MigrationStatus::Failed);

        gate.notify_one();
        let status = h.manager.execute(&second).await.unwrap();
        assert!(status.is_terminal());
    }

    #[tokio::test]
    async fn test_second_manager_leaves_a_live_run_alone() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(
            Arc::new(GatedCopyTool { gate: gate.clone() }),
            FixedSpaceProbe::new(50),
        );
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        h.manager.start(&id).await.unwrap();

        // Another process opening the same work directory, e.g. `ferry status`.
        let other = MigrationManager::new(
            h.config.clone(),
            h.discovery.clone(),
            h.runner.clone(),
            Arc::new(FixedSpaceProbe::new(50)),
        )
        .unwrap();
        assert_eq!(other.load_persisted().await.unwrap(), 1);
        assert!(other.recover_interrupted().await.unwrap().is_empty());
        assert_eq!(other.get(&id).await.unwrap().status, MigrationStatus::InProgress);
        let on_disk = h.manager.work_dir().load_record(&id).unwrap().unwrap();
        assert_eq!(on_disk.status, MigrationStatus::InProgress);

        assert!(matches!(
            other.rollback(&id).await.unwrap_err(),
            FerryError::MigrationBusy { owner: Some(_), .. }
        ));
        assert!(matches!(
            other.cleanup(&id, true).await.unwrap_err(),
            FerryError::MigrationBusy { .. }
        ));
        assert!(matches!(
            other.execute(&id).await.unwrap_err(),
            FerryError::MigrationBusy { .. }
        ));
        assert!(h.runner.calls_to("umount").is_empty());
        assert_eq!(h.manager.get(&id).await.unwrap().status, MigrationStatus::InProgress);

        gate.notify_one();
        assert_eq!(wait_until_finished(&h.manager, &id).await, MigrationStatus::Failed);
        let lock_path = h.manager.work_dir().lock_path(&id);
        for _ in 0..500 {
            if !RunLock::is_held(&lock_path).unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Once the owner is done the other manager sees the outcome on disk.
        other.rollback(&id).await.unwrap();
        assert_eq!(other.get(&id).await.unwrap().status, MigrationStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_low_space_on_target_is_critical() {
        let gate = Arc::new(Notify::new());
        let dir_probe = FixedSpaceProbe::new(5);
        let h = harness_with(Arc::new(GatedCopyTool { gate: gate.clone() }), dir_probe);
        let id = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], None)
            .await
            .unwrap();
        h.manager.start(&id).await.unwrap();

        let health = h.manager.health(&id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Critical);
        let mount_point = h.target_root().display().to_string();
        assert!(health.issues.iter().any(|issue| issue.contains(&mount_point)));

        gate.notify_one();
        wait_until_finished(&h.manager, &id).await;
    }

    #[tokio::test]
    async fn test_state_survives_a_restart() {
        let h = harness();
        let ready = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("ready".to_string()))
            .await
            .unwrap();

        // A snapshot left behind by a process that died mid-run.
        let mut running = h.manager.get(&ready).await.unwrap();
        running.migration_id = "crashed".to_string();
        running.mark_started().unwrap();
        h.manager.work_dir().save_record(&running).unwrap();

        let restarted = MigrationManager::new(
            h.config.clone(),
            h.discovery.clone(),
            h.runner.clone(),
            Arc::new(FixedSpaceProbe::new(50)),
        )
        .unwrap();
        assert_eq!(restarted.load_persisted().await.unwrap(), 2);
        // Loading never rewrites snapshots.
        assert_eq!(restarted.get("crashed").await.unwrap().status, MigrationStatus::InProgress);
        assert_eq!(
            restarted.recover_interrupted().await.unwrap(),
            vec!["crashed".to_string()]
        );

        let reloaded = restarted.get(&ready).await.unwrap();
        assert_eq!(reloaded.status, MigrationStatus::Ready);
        assert_eq!(reloaded.total_files, 100);
        assert_eq!(
            restarted.metadata(&ready).unwrap().assessment.total_size_bytes,
            reloaded.total_bytes
        );

        let crashed = restarted.get("crashed").await.unwrap();
        assert_eq!(crashed.status, MigrationStatus::Failed);
        assert!(crashed.error_message.unwrap().starts_with("interrupted"));
        assert!(crashed.rollback_available);
    }

    #[tokio::test]
    async fn test_statistics_and_cleanup() {
        let h = harness();
        let done = h
            .manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("done".to_string()))
            .await
            .unwrap();
        h.manager.execute(&done).await.unwrap();
        h.manager
            .create_plan(SOURCE, &[TARGET.to_string()], Some("waiting".to_string()))
            .await
            .unwrap();

        let stats = h.manager.statistics().await;
        assert_eq!(stats.total_migrations, 2);
        assert_eq!(stats.by_status[&MigrationStatus::Completed], 1);
        assert_eq!(stats.by_status[&MigrationStatus::Ready], 1);
        assert_eq!(stats.average_success_rate, Some(1.0));

        h.manager.cleanup(&done, false).await.unwrap();
        assert!(h.manager.get(&done).await.is_err());
        assert!(!h.manager.work_dir().progress_path(&done).exists());
        assert!(h.manager.work_dir().backup_dir(&done).exists());
        assert_eq!(h.manager.list().await.len(), 1);
    }
}
