//! Bulk copy through an external tool.

use crate::progress::LineBuffer;
use crate::FerryError;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct CopyRequest {
    /// Directory whose contents are copied.
    pub source: PathBuf,
    /// Directory the contents land in.
    pub target: PathBuf,
    /// Name fragments to leave behind, matched case-insensitively.
    pub excludes: Vec<String>,
}

/// Runs the copy and forwards every progress line it prints to `lines`.
/// Returns once the tool has exited; a non-zero exit is an error.
#[async_trait::async_trait]
pub trait CopyTool: Send + Sync {
    async fn copy(
        &self,
        request: &CopyRequest,
        lines: UnboundedSender<String>,
    ) -> Result<(), FerryError>;
}

/// `rsync -aHAX --info=progress2` from source to target.
#[derive(Debug, Clone, Default)]
pub struct RsyncCopyTool {
    program: Option<PathBuf>,
}

impl RsyncCopyTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn locate(&self) -> Result<PathBuf, FerryError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => which::which("rsync").map_err(|_| FerryError::ToolNotFound("rsync".to_string())),
        }
    }

    fn arguments(request: &CopyRequest) -> Vec<String> {
        let mut args = vec![
            "-aHAX".to_string(),
            "--info=progress2".to_string(),
            "--no-inc-recursive".to_string(),
        ];
        for fragment in &request.excludes {
            args.push(format!("--exclude={}", exclude_pattern(fragment)));
        }
        // Trailing slash: copy the contents, not the directory itself.
        args.push(format!("{}/", request.source.display().to_string().trim_end_matches('/')));
        args.push(request.target.display().to_string());
        args
    }
}

/// rsync exclude pattern matching any name that contains `fragment`,
/// ignoring ASCII case: `Thumbs.db` becomes `*[tT][hH][uU][mM][bB][sS].[dD][bB]*`.
pub fn exclude_pattern(fragment: &str) -> String {
    let mut pattern = String::from("*");
    for c in fragment.chars() {
        if c.is_ascii_alphabetic() {
            pattern.push('[');
            pattern.push(c.to_ascii_lowercase());
            pattern.push(c.to_ascii_uppercase());
            pattern.push(']');
        } else {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
    }
    pattern.push('*');
    pattern
}

enum PatternToken {
    Any,
    OneOf(Vec<char>),
    Literal(char),
}

fn tokenize(pattern: &str) -> Vec<PatternToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => tokens.push(PatternToken::Any),
            '[' => {
                let class: Vec<char> = chars.by_ref().take_while(|&c| c != ']').collect();
                tokens.push(PatternToken::OneOf(class));
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    tokens.push(PatternToken::Literal(next));
                }
            }
            other => tokens.push(PatternToken::Literal(other)),
        }
    }
    tokens
}

/// Whether a single path component matches an exclude pattern, using the
/// subset of rsync wildcards [`exclude_pattern`] produces: `*`, plain
/// character classes and backslash escapes.
pub fn exclude_pattern_matches(pattern: &str, name: &str) -> bool {
    let tokens = tokenize(pattern);
    let name: Vec<char> = name.chars().collect();

    // matched[j]: the tokens so far match name[..j]
    let mut matched = vec![false; name.len() + 1];
    matched[0] = true;
    for token in &tokens {
        let mut next = vec![false; name.len() + 1];
        match token {
            PatternToken::Any => {
                let mut reachable = false;
                for j in 0..=name.len() {
                    reachable |= matched[j];
                    next[j] = reachable;
                }
            }
            PatternToken::OneOf(class) => {
                for j in 0..name.len() {
                    next[j + 1] = matched[j] && class.contains(&name[j]);
                }
            }
            PatternToken::Literal(c) => {
                for j in 0..name.len() {
                    next[j + 1] = matched[j] && name[j] == *c;
                }
            }
        }
        matched = next;
    }
    matched[name.len()]
}

#[async_trait::async_trait]
impl CopyTool for RsyncCopyTool {
    async fn copy(
        &self,
        request: &CopyRequest,
        lines: UnboundedSender<String>,
    ) -> Result<(), FerryError> {
        let program = self.locate()?;
        let args = Self::arguments(request);
        tracing::info!("Running {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FerryError::execution("copy", format!("failed to start rsync: {}", e)))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut captured = String::new();
                let _ = stderr.read_to_string(&mut captured).await;
                captured
            })
        });

        if let Some(mut stdout) = child.stdout.take() {
            let mut buffer = LineBuffer::new();
            let mut chunk = vec![0u8; 8192];
            loop {
                let read = stdout.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                for line in buffer.push(&chunk[..read]) {
                    let _ = lines.send(line);
                }
            }
            if let Some(line) = buffer.finish() {
                let _ = lines.send(line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FerryError::execution("copy", format!("failed to wait for rsync: {}", e)))?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL_LINES).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(FerryError::execution(
                "copy",
                format!("rsync exited with {}: {}", status, tail.join(" | ")),
            ));
        }
        Ok(())
    }
}
