use crate::safety::FormatApproval;
use crate::FerryError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Captured result of a privileged command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Turn an unsuccessful run into an execution error for `step`.
    pub fn check(self, step: &str) -> Result<Self, FerryError> {
        if self.success {
            Ok(self)
        } else {
            let detail = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(FerryError::execution(step, detail))
        }
    }
}

/// Executes allow-listed system commands with input validation and a
/// bounded run time. Implementations return [`FerryError::Timeout`] when the
/// bound is exceeded; callers treat that as a failed step.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn mount(
        &self,
        device: &str,
        target: &Path,
        fstype: Option<&str>,
        options: Option<&str>,
    ) -> Result<CommandOutput, FerryError>;

    /// Create a filesystem on the approved device.
    async fn format(
        &self,
        approval: &FormatApproval,
        fstype: &str,
        label: Option<&str>,
    ) -> Result<CommandOutput, FerryError>;

    async fn run_command(&self, argv: &[String]) -> Result<CommandOutput, FerryError>;
}
