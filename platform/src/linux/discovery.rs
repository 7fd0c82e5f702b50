use ferry_core::{DriveDiscovery, DriveHealth, DriveInfo, DriveRole, FerryError};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tokio::process::Command;

const LSBLK_COLUMNS: &str = "NAME,PATH,UUID,LABEL,MOUNTPOINT,FSTYPE,SIZE,FSUSED,TYPE,PKNAME";

/// Drive discovery backed by `lsblk -b -P`.
pub struct LsblkDriveDiscovery;

impl LsblkDriveDiscovery {
    /// Split one `KEY="value"` line into its fields. Values may carry
    /// `\xHH` escapes for spaces and other special bytes.
    pub fn parse_pairs(line: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        let mut current_key = String::new();
        let mut current_value: Vec<u8> = Vec::new();
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();

        while let Some(ch) = chars.next() {
            if in_quotes && ch == '\\' {
                // \xHH, otherwise the next character is literal
                if chars.peek() == Some(&'x') {
                    chars.next();
                    let hex: String = chars.by_ref().take(2).collect();
                    match u8::from_str_radix(&hex, 16) {
                        Ok(byte) => current_value.push(byte),
                        Err(_) => current_value.extend(format!("\\x{}", hex).as_bytes()),
                    }
                } else if let Some(next) = chars.next() {
                    let mut buf = [0u8; 4];
                    current_value.extend(next.encode_utf8(&mut buf).as_bytes());
                }
                continue;
            }

            if ch == '"' {
                in_quotes = !in_quotes;
                if !in_quotes && !current_key.is_empty() {
                    fields.insert(
                        std::mem::take(&mut current_key),
                        String::from_utf8_lossy(&current_value).into_owned(),
                    );
                    current_value.clear();
                }
            } else if in_quotes {
                let mut buf = [0u8; 4];
                current_value.extend(ch.encode_utf8(&mut buf).as_bytes());
            } else if ch != '=' && ch != ' ' {
                current_key.push(ch);
            }
        }
        fields
    }

    /// Drives and partitions from lsblk output. Loop devices, optical
    /// drives and other non-disk types are skipped.
    pub fn parse_lsblk(output: &str) -> Vec<DriveInfo> {
        let mut drives = Vec::new();

        for line in output.lines() {
            let fields = Self::parse_pairs(line);
            let non_empty = |key: &str| {
                fields
                    .get(key)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };

            match fields.get("TYPE").map(String::as_str) {
                Some("disk") | Some("part") => {}
                _ => continue,
            }

            let name = match non_empty("NAME") {
                Some(name) => name,
                None => continue,
            };
            let device = non_empty("PATH").unwrap_or_else(|| format!("/dev/{}", name));
            let label = non_empty("LABEL");
            let mount_point = non_empty("MOUNTPOINT").map(PathBuf::from);
            let filesystem = non_empty("FSTYPE");
            let size_bytes = non_empty("SIZE")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let used_bytes = non_empty("FSUSED")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let parent = non_empty("PKNAME").unwrap_or_else(|| name.clone());

            let role = Self::role_for(label.as_deref(), mount_point.as_ref(), filesystem.is_some());

            drives.push(DriveInfo {
                device,
                uuid: non_empty("UUID"),
                label,
                mount_point,
                filesystem,
                role,
                size_bytes,
                used_bytes,
                health: Self::health_of(&parent),
            });
        }

        drives.sort_by(|a, b| a.device.cmp(&b.device));
        drives
    }

    /// A drive labelled or mounted as parity is a parity drive; any other
    /// drive carrying a filesystem holds data.
    pub fn role_for(label: Option<&str>, mount_point: Option<&PathBuf>, has_filesystem: bool) -> DriveRole {
        let mentions_parity = |s: &str| s.to_ascii_lowercase().contains("parity");
        if label.map_or(false, mentions_parity)
            || mount_point.map_or(false, |mp| mentions_parity(&mp.to_string_lossy()))
        {
            DriveRole::Parity
        } else if has_filesystem {
            DriveRole::Data
        } else {
            DriveRole::Unassigned
        }
    }

    fn health_of(disk_name: &str) -> DriveHealth {
        let state_path = format!("/sys/block/{}/device/state", disk_name);
        match fs::read_to_string(&state_path) {
            Ok(state) => match state.trim() {
                "running" | "live" => DriveHealth::Healthy,
                "offline" | "dead" => DriveHealth::Failing,
                other => {
                    log::debug!("{} reports device state {}", disk_name, other);
                    DriveHealth::Warning
                }
            },
            Err(_) => DriveHealth::Unknown,
        }
    }
}

#[async_trait::async_trait]
impl DriveDiscovery for LsblkDriveDiscovery {
    async fn discover_drives(&self) -> Result<Vec<DriveInfo>, FerryError> {
        let lsblk = which::which("lsblk").map_err(|_| FerryError::ToolNotFound("lsblk".to_string()))?;
        let output = Command::new(lsblk)
            .args(["-b", "-P", "-o", LSBLK_COLUMNS])
            .output()
            .await
            .map_err(|e| FerryError::execution("discover drives", format!("failed to run lsblk: {}", e)))?;

        if !output.status.success() {
            return Err(FerryError::execution(
                "discover drives",
                format!("lsblk failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
            ));
        }

        let drives = Self::parse_lsblk(&String::from_utf8_lossy(&output.stdout));
        log::info!("Discovered {} drives", drives.len());
        Ok(drives)
    }
}
