//! fstab rewriting and mount-table lookups.
//!
//! Both files share the same whitespace-separated layout, with spaces in
//! paths written as `\040`.

use crate::DriveInfo;
use std::path::{Path, PathBuf};

/// One line to append to fstab.
#[derive(Debug, Clone, PartialEq)]
pub struct FstabEntry {
    /// `UUID=...` when the UUID is known, the device path otherwise.
    pub spec: String,
    pub mount_point: PathBuf,
    pub fstype: String,
    pub options: String,
}

impl FstabEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} 0 2",
            self.spec,
            escape(&self.mount_point.to_string_lossy()),
            self.fstype,
            self.options
        )
    }
}

/// Mount-table row, as read from `/proc/mounts`.
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fstype: String,
}

pub fn escape(path: &str) -> String {
    path.replace('\\', "\\134")
        .replace(' ', "\\040")
        .replace('\t', "\\011")
        .replace('\n', "\\012")
}

pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: unescape(device),
                mount_point: PathBuf::from(unescape(mount_point)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// True when the table shows `device` mounted at `mount_point`.
pub fn is_mounted_at(table: &str, device: &str, mount_point: &Path) -> bool {
    parse_mount_table(table)
        .iter()
        .any(|entry| entry.device == device && entry.mount_point == mount_point)
}

/// Comment out every active line that mounts the source or occupies one of
/// the new mount points, then append `entries` under a marker comment.
pub fn rewrite(content: &str, migration_id: &str, source: &DriveInfo, entries: &[FstabEntry]) -> String {
    let mut out = String::with_capacity(content.len() + entries.len() * 80);

    for line in content.lines() {
        if refers_to_source(line, source) {
            out.push_str(&format!("# ferry {} disabled: {}\n", migration_id, line));
        } else if occupies_mount_point(line, entries) {
            out.push_str(&format!("# ferry {} replaced: {}\n", migration_id, line));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    if !entries.is_empty() {
        out.push_str(&format!("# Added by ferry migration {}\n", migration_id));
        for entry in entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
    }
    out
}

fn active_fields(line: &str) -> Option<Vec<&str>> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() < 2 {
        None
    } else {
        Some(fields)
    }
}

fn refers_to_source(line: &str, source: &DriveInfo) -> bool {
    let Some(fields) = active_fields(line) else {
        return false;
    };
    let spec = fields[0];

    if spec == source.device {
        return true;
    }
    if let (Some(uuid), Some(value)) = (&source.uuid, spec.strip_prefix("UUID=")) {
        if value.trim_matches('"').eq_ignore_ascii_case(uuid) {
            return true;
        }
    }
    if let (Some(label), Some(value)) = (&source.label, spec.strip_prefix("LABEL=")) {
        if unescape(value.trim_matches('"')) == *label {
            return true;
        }
    }
    match &source.mount_point {
        Some(mount_point) => Path::new(&unescape(fields[1])) == mount_point,
        None => false,
    }
}

fn occupies_mount_point(line: &str, entries: &[FstabEntry]) -> bool {
    let Some(fields) = active_fields(line) else {
        return false;
    };
    let mount_point = PathBuf::from(unescape(fields[1]));
    entries.iter().any(|entry| entry.mount_point == mount_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DriveHealth, DriveRole};

    fn source() -> DriveInfo {
        DriveInfo {
            device: "/dev/sdb1".to_string(),
            uuid: Some("01D9-AB12".to_string()),
            label: Some("Media Drive".to_string()),
            mount_point: Some(PathBuf::from("/mnt/media")),
            filesystem: Some("ntfs".to_string()),
            role: DriveRole::Data,
            size_bytes: 0,
            used_bytes: 0,
            health: DriveHealth::Healthy,
        }
    }

    fn entry(spec: &str, mount_point: &str) -> FstabEntry {
        FstabEntry {
            spec: spec.to_string(),
            mount_point: PathBuf::from(mount_point),
            fstype: "ext4".to_string(),
            options: "defaults,nofail".to_string(),
        }
    }

    #[test]
    fn test_rewrite_disables_source_and_appends_targets() {
        let fstab = "\
# /etc/fstab
UUID=root-uuid / ext4 errors=remount-ro 0 1
UUID=01d9-ab12 /mnt/media ntfs3 defaults 0 0
/dev/sdd1 /mnt/disk1 vfat defaults 0 0
";
        let updated = rewrite(
            fstab,
            "m1",
            &source(),
            &[entry("UUID=new-uuid", "/mnt/disk1")],
        );
        let lines: Vec<&str> = updated.lines().collect();

        assert_eq!(lines[0], "# /etc/fstab");
        assert_eq!(lines[1], "UUID=root-uuid / ext4 errors=remount-ro 0 1");
        assert!(lines[2].starts_with("# ferry m1 disabled: UUID=01d9-ab12"));
        assert!(lines[3].starts_with("# ferry m1 replaced: /dev/sdd1"));
        assert_eq!(lines[4], "# Added by ferry migration m1");
        assert_eq!(lines[5], "UUID=new-uuid /mnt/disk1 ext4 defaults,nofail 0 2");
    }

    #[test]
    fn test_source_matched_by_label_device_or_mount_point() {
        let drive = source();
        assert!(refers_to_source("LABEL=Media\\040Drive /srv ntfs defaults 0 0", &drive));
        assert!(refers_to_source("/dev/sdb1 /srv ntfs defaults 0 0", &drive));
        assert!(refers_to_source("/dev/disk/by-id/x /mnt/media ntfs defaults 0 0", &drive));
        assert!(!refers_to_source("# /dev/sdb1 /mnt/media ntfs defaults 0 0", &drive));
        assert!(!refers_to_source("/dev/sdb10 /mnt/other ext4 defaults 0 0", &drive));
    }

    #[test]
    fn test_paths_with_spaces_are_escaped() {
        let line = entry("/dev/sdc1", "/mnt/new disk").to_line();
        assert_eq!(line, "/dev/sdc1 /mnt/new\\040disk ext4 defaults,nofail 0 2");
        assert_eq!(unescape("/mnt/new\\040disk"), "/mnt/new disk");
    }

    #[test]
    fn test_mount_table_lookup() {
        let table = "\
sysfs /sys sysfs rw 0 0
/dev/sdb1 /mnt/media\\040drive ntfs3 rw 0 0
";
        assert!(is_mounted_at(table, "/dev/sdb1", Path::new("/mnt/media drive")));
        assert!(!is_mounted_at(table, "/dev/sdb1", Path::new("/mnt/media")));
        assert!(!is_mounted_at(table, "/dev/sdc1", Path::new("/mnt/media drive")));
        assert_eq!(parse_mount_table(table).len(), 2);
    }
}
