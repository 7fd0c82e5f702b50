use ferry_core::{CommandOutput, CommandRunner, FerryError, FormatApproval, MigrationConfig};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Programs `run_command` will execute.
pub const ALLOWED_PROGRAMS: &[&str] = &["mount", "umount", "mkdir", "sync", "blkid"];

/// Filesystems `format` knows how to create.
pub const FORMATTABLE_FILESYSTEMS: &[&str] = &["ext4", "ext3", "xfs", "btrfs", "vfat", "exfat", "ntfs"];

/// Runs allow-listed system commands, through `sudo -n` when not root,
/// each bounded by the configured timeout.
pub struct SystemCommandRunner {
    timeout: Duration,
    use_sudo: bool,
}

impl SystemCommandRunner {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            timeout: config.command_timeout(),
            use_sudo: !nix::unistd::geteuid().is_root(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            use_sudo: !nix::unistd::geteuid().is_root(),
        }
    }

    /// Arguments must not smuggle in a second line or a NUL.
    pub fn validate_argument(arg: &str) -> Result<(), FerryError> {
        if arg.is_empty() || arg.contains('\0') || arg.contains('\n') || arg.contains('\r') {
            return Err(FerryError::InvalidInput(format!("invalid argument {:?}", arg)));
        }
        Ok(())
    }

    pub fn validate_device(device: &str) -> Result<(), FerryError> {
        let valid = device.starts_with("/dev/")
            && !device.contains("..")
            && device[5..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | ':'));
        if valid && device.len() > 5 {
            Ok(())
        } else {
            Err(FerryError::InvalidInput(format!("invalid device path {:?}", device)))
        }
    }

    pub fn validate_mount_point(path: &Path) -> Result<(), FerryError> {
        let text = path.to_string_lossy();
        if !path.is_absolute() || text.split('/').any(|part| part == "..") {
            return Err(FerryError::InvalidInput(format!(
                "mount point {} must be an absolute path",
                path.display()
            )));
        }
        Self::validate_argument(&text)
    }

    /// `mkfs.<fstype>` arguments for the approved device.
    pub fn format_argv(
        approval: &FormatApproval,
        fstype: &str,
        label: Option<&str>,
    ) -> Result<Vec<String>, FerryError> {
        if !FORMATTABLE_FILESYSTEMS.contains(&fstype) {
            return Err(FerryError::InvalidInput(format!("unsupported filesystem {}", fstype)));
        }
        Self::validate_device(approval.device())?;

        let mut argv = vec![format!("mkfs.{}", fstype)];
        match fstype {
            "ext4" | "ext3" => argv.push("-F".to_string()),
            "xfs" | "btrfs" | "ntfs" => argv.push("-f".to_string()),
            _ => {}
        }
        if let Some(label) = label {
            Self::validate_argument(label)?;
            let flag = if fstype == "vfat" { "-n" } else { "-L" };
            argv.push(flag.to_string());
            argv.push(label.to_string());
        }
        argv.push(approval.device().to_string());
        Ok(argv)
    }

    async fn execute(&self, argv: &[String]) -> Result<CommandOutput, FerryError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FerryError::InvalidInput("empty command".to_string()))?;

        let mut command = if self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(program);
            command
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!("Running: {}", argv.join(" "));
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result.map_err(|e| {
                FerryError::execution(program.as_str(), format!("failed to start: {}", e))
            })?,
            Err(_) => {
                log::error!("{} timed out after {:?}", program, self.timeout);
                return Err(FerryError::Timeout(format!(
                    "{} did not finish within {} seconds",
                    argv.join(" "),
                    self.timeout.as_secs()
                )));
            }
        };

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            log::warn!("{} exited with {}: {}", program, output.status, result.stderr.trim());
        }
        Ok(result)
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn mount(
        &self,
        device: &str,
        target: &Path,
        fstype: Option<&str>,
        options: Option<&str>,
    ) -> Result<CommandOutput, FerryError> {
        Self::validate_device(device)?;
        Self::validate_mount_point(target)?;

        let mut argv = vec!["mount".to_string()];
        if let Some(fstype) = fstype {
            Self::validate_argument(fstype)?;
            argv.extend(["-t".to_string(), fstype.to_string()]);
        }
        if let Some(options) = options {
            Self::validate_argument(options)?;
            argv.extend(["-o".to_string(), options.to_string()]);
        }
        argv.push(device.to_string());
        argv.push(target.to_string_lossy().into_owned());
        self.execute(&argv).await
    }

    async fn format(
        &self,
        approval: &FormatApproval,
        fstype: &str,
        label: Option<&str>,
    ) -> Result<CommandOutput, FerryError> {
        let argv = Self::format_argv(approval, fstype, label)?;
        log::warn!(
            "Formatting {} as {} for migration {}",
            approval.device(),
            fstype,
            approval.migration_id()
        );
        self.execute(&argv).await
    }

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, FerryError> {
        let program = argv
            .first()
            .ok_or_else(|| FerryError::InvalidInput("empty command".to_string()))?;
        if !ALLOWED_PROGRAMS.contains(&program.as_str()) {
            return Err(FerryError::InvalidInput(format!("{} is not an allowed command", program)));
        }
        for arg in argv {
            Self::validate_argument(arg)?;
        }
        self.execute(argv).await
    }
}
