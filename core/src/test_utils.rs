/// Test utilities and mock collaborators - NEVER touch real hardware
use crate::command::{CommandOutput, CommandRunner};
use crate::copy::{exclude_pattern, exclude_pattern_matches, CopyRequest, CopyTool};
use crate::monitor::{FreeSpace, SpaceProbe};
use crate::safety::FormatApproval;
use crate::{DriveDiscovery, DriveHealth, DriveInfo, DriveRole, FerryError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// A drive with the given filesystem, optionally mounted.
pub fn mock_drive(device: &str, filesystem: &str, mount_point: Option<&Path>) -> DriveInfo {
    let name = device.rsplit('/').next().unwrap_or(device);
    DriveInfo {
        device: device.to_string(),
        uuid: Some(format!("uuid-{}", name)),
        label: Some(name.to_uppercase()),
        mount_point: mount_point.map(Path::to_path_buf),
        filesystem: Some(filesystem.to_string()),
        role: DriveRole::Data,
        size_bytes: 4 * 1_099_511_627_776,
        used_bytes: 0,
        health: DriveHealth::Healthy,
    }
}

/// Drive discovery over a fixed, editable list.
pub struct MockDriveDiscovery {
    drives: Mutex<Vec<DriveInfo>>,
    call_count: Arc<Mutex<usize>>,
    fail: Mutex<bool>,
}

impl MockDriveDiscovery {
    pub fn new(drives: Vec<DriveInfo>) -> Self {
        Self {
            drives: Mutex::new(drives),
            call_count: Arc::new(Mutex::new(0)),
            fail: Mutex::new(false),
        }
    }

    pub fn set_drives(&self, drives: Vec<DriveInfo>) {
        *self.drives.lock().unwrap() = drives;
    }

    /// Change one drive in place, e.g. to give a formatted target its new UUID.
    pub fn update_drive(&self, device: &str, f: impl FnOnce(&mut DriveInfo)) {
        if let Some(drive) = self.drives.lock().unwrap().iter_mut().find(|d| d.device == device) {
            f(drive);
        }
    }

    pub fn fail_discovery(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl DriveDiscovery for MockDriveDiscovery {
    async fn discover_drives(&self) -> Result<Vec<DriveInfo>, FerryError> {
        *self.call_count.lock().unwrap() += 1;
        if *self.fail.lock().unwrap() {
            return Err(FerryError::execution("discover drives", "mock discovery failure"));
        }
        Ok(self.drives.lock().unwrap().clone())
    }
}

/// Records every command instead of running it.
///
/// `mkdir -p <dir>` is honored for real so copies into freshly "mounted"
/// targets land in a directory that exists. Any program registered with
/// [`MockCommandRunner::fail_program`] returns an unsuccessful output.
#[derive(Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<Vec<String>>>,
    formatted: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `program` (`mount`, `umount`, `mkfs`, ...) fail.
    pub fn fail_program(&self, program: &str) {
        self.failing.lock().unwrap().push(program.to_string());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(program))
            .collect()
    }

    pub fn formatted_devices(&self) -> Vec<String> {
        self.formatted.lock().unwrap().clone()
    }

    fn record(&self, argv: Vec<String>) -> CommandOutput {
        let program = argv.first().cloned().unwrap_or_default();
        self.calls.lock().unwrap().push(argv);
        if self.failing.lock().unwrap().iter().any(|p| *p == program) {
            CommandOutput::failed(format!("mock {} failure", program))
        } else {
            CommandOutput::ok()
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for MockCommandRunner {
    async fn mount(
        &self,
        device: &str,
        target: &Path,
        fstype: Option<&str>,
        options: Option<&str>,
    ) -> Result<CommandOutput, FerryError> {
        let mut argv = vec!["mount".to_string()];
        if let Some(fstype) = fstype {
            argv.extend(["-t".to_string(), fstype.to_string()]);
        }
        if let Some(options) = options {
            argv.extend(["-o".to_string(), options.to_string()]);
        }
        argv.extend([device.to_string(), target.display().to_string()]);
        Ok(self.record(argv))
    }

    async fn format(
        &self,
        approval: &FormatApproval,
        fstype: &str,
        _label: Option<&str>,
    ) -> Result<CommandOutput, FerryError> {
        let output = self.record(vec!["mkfs".to_string(), fstype.to_string(), approval.device().to_string()]);
        if output.success {
            self.formatted.lock().unwrap().push(approval.device().to_string());
        }
        Ok(output)
    }

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, FerryError> {
        let output = self.record(argv.to_vec());
        if output.success && argv.first().map(String::as_str) == Some("mkdir") {
            for dir in argv.iter().skip(1).filter(|a| !a.starts_with('-')) {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(output)
    }
}

/// Copies the tree for real and prints rsync-style progress lines. Entries
/// are excluded with the same patterns `RsyncCopyTool` passes to rsync.
#[derive(Default)]
pub struct MockCopyTool {
    failure: Option<String>,
}

impl MockCopyTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies nothing; prints one progress line and fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl CopyTool for MockCopyTool {
    async fn copy(
        &self,
        request: &CopyRequest,
        lines: UnboundedSender<String>,
    ) -> Result<(), FerryError> {
        let patterns: Vec<String> = request.excludes.iter().map(|f| exclude_pattern(f)).collect();
        let excluded = |name: &str| patterns.iter().any(|p| exclude_pattern_matches(p, name));
        let files: Vec<PathBuf> = walkdir::WalkDir::new(&request.source)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !excluded(&e.file_name().to_string_lossy()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        let total = files.len();

        if let Some(message) = &self.failure {
            let _ = lines.send(format!("0   0%   0.00kB/s   0:00:00 (xfr#0, to-chk={}/{})", total, total));
            return Err(FerryError::execution("copy", message.clone()));
        }

        let mut bytes = 0u64;
        for (done, path) in files.iter().enumerate() {
            let relative = path.strip_prefix(&request.source).unwrap_or(path);
            let dest = request.target.join(relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            bytes += std::fs::copy(path, &dest)?;
            let modified = std::fs::metadata(path)?.modified()?;
            std::fs::File::options()
                .write(true)
                .open(&dest)?
                .set_modified(modified)?;

            let done = done + 1;
            let _ = lines.send(format!(
                "{:>14} {:>3}%   10.00MB/s    0:00:01 (xfr#{}, to-chk={}/{})",
                bytes,
                done * 100 / total,
                done,
                total - done,
                total
            ));
        }
        Ok(())
    }
}

/// Free space per mount point, with a fallback for unknown paths.
pub struct FixedSpaceProbe {
    default: FreeSpace,
    readings: HashMap<PathBuf, FreeSpace>,
}

impl FixedSpaceProbe {
    /// Every path reports `free_percent`% of 100 GiB free.
    pub fn new(free_percent: u64) -> Self {
        Self {
            default: Self::reading(free_percent),
            readings: HashMap::new(),
        }
    }

    pub fn with_reading(mut self, path: impl Into<PathBuf>, free_percent: u64) -> Self {
        self.readings.insert(path.into(), Self::reading(free_percent));
        self
    }

    fn reading(free_percent: u64) -> FreeSpace {
        let total_bytes = 100 * 1_073_741_824;
        FreeSpace {
            total_bytes,
            available_bytes: total_bytes / 100 * free_percent,
        }
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn free_space(&self, path: &Path) -> Result<FreeSpace, FerryError> {
        Ok(*self.readings.get(path).unwrap_or(&self.default))
    }
}
