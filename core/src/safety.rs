//! Format safety for migration targets.
//!
//! Formatting is the only destructive operation the migration performs. The
//! command runner will only format a device named by a [`FormatApproval`], and
//! the only way to obtain one is [`FormatGuard::approve`], which refuses the
//! migration source (by path, UUID or containing disk), parity drives and
//! anything mounted on a system path.

use crate::{DriveInfo, DriveRole, FerryError};
use chrono::{DateTime, Utc};
use std::path::Path;

const CRITICAL_MOUNT_POINTS: &[&str] = &["/", "/boot", "/boot/efi", "/usr", "/var", "/etc", "/home"];

/// Proof that a device passed the format safety checks for one migration.
#[derive(Debug)]
pub struct FormatApproval {
    device: String,
    migration_id: String,
    approved_at: DateTime<Utc>,
}

impl FormatApproval {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    pub fn approved_at(&self) -> DateTime<Utc> {
        self.approved_at
    }
}

/// Issues format approvals for the targets of a single migration.
pub struct FormatGuard<'a> {
    migration_id: &'a str,
    source: &'a DriveInfo,
}

impl<'a> FormatGuard<'a> {
    pub fn new(migration_id: &'a str, source: &'a DriveInfo) -> Self {
        Self { migration_id, source }
    }

    pub fn approve(&self, target: &DriveInfo) -> Result<FormatApproval, FerryError> {
        self.check_not_source(target)?;
        check_not_parity(target)?;
        check_not_critical(target)?;

        Ok(FormatApproval {
            device: target.device.clone(),
            migration_id: self.migration_id.to_string(),
            approved_at: Utc::now(),
        })
    }

    fn check_not_source(&self, target: &DriveInfo) -> Result<(), FerryError> {
        let source = self.source;

        if target.device == source.device {
            return Err(FerryError::UnsafeDevice(format!(
                "{} is the migration source",
                target.device
            )));
        }

        if let (Some(target_uuid), Some(source_uuid)) = (&target.uuid, &source.uuid) {
            if target_uuid.eq_ignore_ascii_case(source_uuid) {
                return Err(FerryError::UnsafeDevice(format!(
                    "{} has the same UUID as the migration source {}",
                    target.device, source.device
                )));
            }
        }

        if is_partition_of(&source.device, &target.device)
            || is_partition_of(&target.device, &source.device)
        {
            return Err(FerryError::UnsafeDevice(format!(
                "{} overlaps the migration source {}",
                target.device, source.device
            )));
        }

        if let (Some(target_mp), Some(source_mp)) = (&target.mount_point, &source.mount_point) {
            if target_mp == source_mp {
                return Err(FerryError::UnsafeDevice(format!(
                    "{} is mounted at the source mount point {}",
                    target.device,
                    source_mp.display()
                )));
            }
        }

        Ok(())
    }
}

/// Whether `partition` is `disk` itself or one of its partitions:
/// `/dev/sdb1` and `/dev/nvme0n1p2` belong to `/dev/sdb` and `/dev/nvme0n1`,
/// `/dev/sdb10` does not belong to `/dev/sdb1`.
pub fn is_partition_of(partition: &str, disk: &str) -> bool {
    let Some(rest) = partition.strip_prefix(disk) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    // Disks whose name ends in a digit number their partitions after a `p`.
    let digits = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn check_not_parity(target: &DriveInfo) -> Result<(), FerryError> {
    if target.role == DriveRole::Parity {
        return Err(FerryError::UnsafeDevice(format!(
            "{} is a parity drive",
            target.device
        )));
    }
    Ok(())
}

fn check_not_critical(target: &DriveInfo) -> Result<(), FerryError> {
    if let Some(mount_point) = &target.mount_point {
        if is_critical_mount_point(mount_point) {
            return Err(FerryError::UnsafeDevice(format!(
                "{} is mounted at system path {}",
                target.device,
                mount_point.display()
            )));
        }
    }
    Ok(())
}

pub fn is_critical_mount_point(path: &Path) -> bool {
    let path = path.to_string_lossy();
    let trimmed = match path.trim_end_matches('/') {
        "" => "/",
        other => other,
    };
    CRITICAL_MOUNT_POINTS.contains(&trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DriveHealth, DriveRole};
    use std::path::PathBuf;

    fn drive(device: &str, uuid: Option<&str>, mount: Option<&str>) -> DriveInfo {
        DriveInfo {
            device: device.to_string(),
            uuid: uuid.map(String::from),
            label: None,
            mount_point: mount.map(PathBuf::from),
            filesystem: Some("ntfs".to_string()),
            role: DriveRole::Data,
            size_bytes: 1_000_000,
            used_bytes: 0,
            health: DriveHealth::Healthy,
        }
    }

    #[test]
    fn test_guard_refuses_source_device() {
        let source = drive("/dev/sdb1", Some("AAAA"), Some("/mnt/old"));
        let guard = FormatGuard::new("m1", &source);
        assert!(matches!(
            guard.approve(&source.clone()),
            Err(FerryError::UnsafeDevice(_))
        ));
    }

    #[test]
    fn test_guard_refuses_same_uuid_under_other_path() {
        let source = drive("/dev/sdb1", Some("AAAA"), Some("/mnt/old"));
        let alias = drive("/dev/disk/by-uuid/AAAA", Some("aaaa"), None);
        let guard = FormatGuard::new("m1", &source);
        assert!(guard.approve(&alias).is_err());
    }

    #[test]
    fn test_guard_refuses_disk_containing_source() {
        let source = drive("/dev/sdb1", None, Some("/mnt/old"));
        let whole_disk = drive("/dev/sdb", None, None);
        let guard = FormatGuard::new("m1", &source);
        assert!(guard.approve(&whole_disk).is_err());
    }

    #[test]
    fn test_guard_refuses_parity_drive() {
        let source = drive("/dev/sdb1", Some("AAAA"), Some("/mnt/old"));
        let mut parity = drive("/dev/sdd1", Some("DDDD"), Some("/mnt/parity"));
        parity.role = DriveRole::Parity;
        let guard = FormatGuard::new("m1", &source);
        assert!(matches!(guard.approve(&parity), Err(FerryError::UnsafeDevice(_))));
    }

    #[test]
    fn test_guard_approves_neighbouring_partition_numbers() {
        let source = drive("/dev/sdb1", None, Some("/mnt/old"));
        let guard = FormatGuard::new("m1", &source);
        assert!(guard.approve(&drive("/dev/sdb10", None, None)).is_ok());
        assert!(guard.approve(&drive("/dev/sdb2", None, None)).is_ok());

        let nvme_source = drive("/dev/nvme0n1p1", None, Some("/mnt/old"));
        let guard = FormatGuard::new("m1", &nvme_source);
        assert!(guard.approve(&drive("/dev/nvme0n1", None, None)).is_err());
        assert!(guard.approve(&drive("/dev/nvme0n1p12", None, None)).is_ok());
    }

    #[test]
    fn test_partition_membership() {
        assert!(is_partition_of("/dev/sdb1", "/dev/sdb"));
        assert!(is_partition_of("/dev/sdb", "/dev/sdb"));
        assert!(is_partition_of("/dev/nvme0n1p2", "/dev/nvme0n1"));
        assert!(!is_partition_of("/dev/sdb10", "/dev/sdb1"));
        assert!(!is_partition_of("/dev/sdbc", "/dev/sdb"));
        assert!(!is_partition_of("/dev/nvme0n1p12", "/dev/nvme0n1p1"));
        assert!(!is_partition_of("/dev/sdc1", "/dev/sdb"));
    }

    #[test]
    fn test_guard_refuses_system_mounts() {
        let source = drive("/dev/sdb1", None, Some("/mnt/old"));
        let root = drive("/dev/nvme0n1p2", None, Some("/"));
        let guard = FormatGuard::new("m1", &source);
        assert!(guard.approve(&root).is_err());
    }

    #[test]
    fn test_guard_approves_unrelated_target() {
        let source = drive("/dev/sdb1", Some("AAAA"), Some("/mnt/old"));
        let target = drive("/dev/sdc1", Some("BBBB"), Some("/mnt/disk1"));
        let guard = FormatGuard::new("m1", &source);
        let approval = guard.approve(&target).unwrap();
        assert_eq!(approval.device(), "/dev/sdc1");
        assert_eq!(approval.migration_id(), "m1");
    }

    #[test]
    fn test_critical_mount_point_ignores_trailing_slash() {
        assert!(is_critical_mount_point(Path::new("/boot/")));
        assert!(is_critical_mount_point(Path::new("/")));
        assert!(!is_critical_mount_point(Path::new("/mnt/disk1")));
    }
}
