//! Sandboxed command execution against filesystem snapshots.
//!
//! A sandbox holds a set of named snapshots of one codebase and executes
//! shell commands against them with a wall-clock timeout and resource caps.
//! Episodes never share snapshots; the execution image is shared read-only.
//!
//! Failure taxonomy: infrastructure failures surface as [`SandboxError`],
//! timeouts come back as an [`ExecOutput`] with `timed_out` set, and ordinary
//! command failures are non-zero exit codes. The three are always
//! distinguishable.

pub mod docker;
pub mod script;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

pub use docker::DockerSandbox;
pub use script::ScriptedSandbox;

/// Well-known snapshot names used by the orchestrator.
pub mod snapshots {
    /// The pristine pre-injection codebase.
    pub const CLEAN: &str = "clean";
    /// Clean + bug diff + oracle test.
    pub const BUGGY: &str = "buggy";

    /// Working copy for solver attempt `i`.
    pub fn attempt(i: u32) -> String {
        format!("attempt-{i}")
    }

    /// Working copy for inverse mutation `i`.
    pub fn mutation(i: usize) -> String {
        format!("mut-{i}")
    }
}

/// Output of one sandboxed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "crate::model::duration_millis")]
    pub duration: Duration,
    /// Whether the command was killed by the wall-clock timeout.
    pub timed_out: bool,
}

impl ExecOutput {
    /// A completed (not timed-out) command.
    pub fn completed(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::from_millis(1),
            timed_out: false,
        }
    }

    /// A command killed by the wall-clock timeout.
    pub fn timeout(after: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", after.as_secs()),
            duration: after,
            timed_out: true,
        }
    }

    /// Zero exit and no timeout.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout and stderr joined for reporting.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Resource caps applied to a sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub max_processes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpu_cores: 2.0,
            max_processes: 256,
        }
    }
}

/// Snapshot-addressed sandbox executor.
///
/// Implementations must guarantee no network access for executed commands and
/// must keep snapshots isolated from each other.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run a shell command inside `snapshot` with a wall-clock timeout.
    async fn exec(
        &self,
        snapshot: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;

    /// Write a file (relative path) into `snapshot`.
    async fn write_file(
        &self,
        snapshot: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    /// Whether a file exists in `snapshot`. Pure filesystem check.
    async fn file_exists(&self, snapshot: &str, path: &str) -> Result<bool, SandboxError>;

    /// Create snapshot `to` as a copy of snapshot `from`.
    async fn fork(&self, from: &str, to: &str) -> Result<(), SandboxError>;

    /// Remove a snapshot and its contents.
    async fn remove(&self, snapshot: &str) -> Result<(), SandboxError>;
}

/// Creates a sandbox for an environment's execution image.
///
/// The orchestrator owns one sandbox per episode; this is the seam that lets
/// tests hand it a scripted sandbox instead of a container.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, env: &crate::model::Environment)
        -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// Starts one Docker container per episode.
#[derive(Default)]
pub struct DockerFactory {
    limits: ResourceLimits,
}

impl DockerFactory {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl SandboxFactory for DockerFactory {
    async fn create(
        &self,
        env: &crate::model::Environment,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let sandbox = DockerSandbox::start(&env.image_ref, &self.limits).await?;
        Ok(Arc::new(sandbox))
    }
}

/// Retry an operation a bounded number of times on infrastructure failure.
///
/// Only `Err(SandboxError)` triggers a retry; expected-negative outcomes
/// (non-zero exits, timeouts inside a successful transport) are returned as-is
/// on the first call. `retries` is the number of *additional* tries after the
/// first.
pub async fn with_retries<T, F, Fut>(retries: u32, mut op: F) -> Result<T, SandboxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SandboxError>>,
{
    let mut last_err = None;
    for attempt in 0..=retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "sandbox call failed, retrying");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}

/// Validate a snapshot-relative path: no traversal, no shell metacharacters.
pub(crate) fn validate_rel_path(path: &str) -> Result<(), SandboxError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains("..")
        || path.chars().any(|c| {
            matches!(
                c,
                '\'' | '"' | '`' | '$' | '!' | '&' | '|' | ';' | '(' | ')' | '{' | '}' | '<'
                    | '>' | '\\' | '\0' | '\n' | '\r'
            )
        })
    {
        return Err(SandboxError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Validate a snapshot name: lowercase alphanumeric plus `-`.
pub(crate) fn validate_snapshot_name(name: &str) -> Result<(), SandboxError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(SandboxError::InvalidPath(name.to_string()));
    }
    Ok(())
}
