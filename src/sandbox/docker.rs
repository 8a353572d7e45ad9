//! Docker-backed sandbox.
//!
//! One ephemeral container per episode, driven over the docker CLI. Snapshots
//! are directories under `/work` inside the container; the clean baseline is
//! seeded from the image's codebase directory at startup and every other
//! snapshot is a `cp -a` fork. Commands run with networking disabled and
//! enforced memory/CPU/pid ceilings.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::{validate_rel_path, validate_snapshot_name, ExecOutput, ResourceLimits, Sandbox};
use crate::error::SandboxError;

/// Directory inside the image that holds the codebase to snapshot.
const IMAGE_CODE_DIR: &str = "/app";

/// Root for snapshot directories inside the container.
const WORK_DIR: &str = "/work";

/// An ephemeral Docker container holding one episode's snapshots.
pub struct DockerSandbox {
    container_name: String,
}

impl DockerSandbox {
    /// Start a container from `image_ref`, seeding the `clean` snapshot from
    /// the image's code directory.
    pub async fn start(image_ref: &str, limits: &ResourceLimits) -> Result<Self, SandboxError> {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            % 1_000_000;
        let container_name = format!("bugforge-{}-{}", uuid::Uuid::new_v4().simple(), suffix);

        // Remove a stale container with the same name, if any.
        if let Err(e) = Command::new("docker")
            .args(["rm", "-f", &container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::debug!(container = %container_name, error = %e, "stale container removal failed (may not exist)");
        }

        let memory = format!("--memory={}m", limits.memory_mb);
        let cpus = format!("--cpus={}", limits.cpu_cores);
        let pids = format!("--pids-limit={}", limits.max_processes);
        let run_output = Command::new("docker")
            .args([
                "run",
                "-d",
                "--name",
                &container_name,
                "--network=none",
                memory.as_str(),
                cpus.as_str(),
                pids.as_str(),
                "-w",
                WORK_DIR,
                image_ref,
                "sleep",
                "7200",
            ])
            .output()
            .await
            .map_err(|e| SandboxError::DaemonUnavailable(e.to_string()))?;

        if !run_output.status.success() {
            return Err(SandboxError::StartFailed {
                name: container_name,
                reason: String::from_utf8_lossy(&run_output.stderr).to_string(),
            });
        }

        let sandbox = Self { container_name };

        // Seed the clean snapshot from the image's codebase.
        let seed_cmd = format!(
            "mkdir -p {WORK_DIR} && cp -a {IMAGE_CODE_DIR} {WORK_DIR}/{}",
            super::snapshots::CLEAN
        );
        let seed = sandbox.raw_exec(&seed_cmd, Duration::from_secs(120)).await?;
        if !seed.success() {
            let reason = seed.stderr.clone();
            sandbox.destroy().await;
            return Err(SandboxError::StartFailed {
                name: "clean snapshot seed".to_string(),
                reason,
            });
        }

        tracing::info!(container = %sandbox.container_name, image = image_ref, "docker sandbox ready");
        Ok(sandbox)
    }

    /// Container name, useful for logging.
    pub fn name(&self) -> &str {
        &self.container_name
    }

    /// Run a command at the container's work root (not inside a snapshot).
    async fn raw_exec(&self, cmd: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            Command::new("docker")
                .args(["exec", "-w", WORK_DIR, &self.container_name, "bash", "-c", cmd])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: started.elapsed(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SandboxError::ExecTransport(e.to_string())),
            Err(_) => Ok(ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
                duration: started.elapsed(),
                timed_out: true,
            }),
        }
    }

    /// Destroy the container (best effort).
    pub async fn destroy(&self) {
        if let Err(e) = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::debug!(container = %self.container_name, error = %e, "container destroy failed");
        }
        tracing::debug!(container = %self.container_name, "docker sandbox destroyed");
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn exec(
        &self,
        snapshot: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        validate_snapshot_name(snapshot)?;
        let started = Instant::now();
        let workdir = format!("{WORK_DIR}/{snapshot}");
        let result = tokio::time::timeout(
            timeout,
            Command::new("docker")
                .args([
                    "exec",
                    "-w",
                    &workdir,
                    &self.container_name,
                    "bash",
                    "-c",
                    command,
                ])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(ExecOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: started.elapsed(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(SandboxError::ExecTransport(e.to_string())),
            Err(_) => Ok(ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
                duration: started.elapsed(),
                timed_out: true,
            }),
        }
    }

    async fn write_file(
        &self,
        snapshot: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        validate_snapshot_name(snapshot)?;
        validate_rel_path(path)?;

        let abs = format!("{WORK_DIR}/{snapshot}/{path}");
        let mkdir_cmd = format!("mkdir -p \"$(dirname '{abs}')\"");
        self.raw_exec(&mkdir_cmd, Duration::from_secs(10)).await?;

        // Pipe content via stdin to avoid shell escaping issues.
        let tee_cmd = format!("cat > '{abs}'");
        let mut child = Command::new("docker")
            .args([
                "exec",
                "-i",
                "-w",
                WORK_DIR,
                &self.container_name,
                "bash",
                "-c",
                &tee_cmd,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::ExecTransport(e.to_string()))?;

        if let Some(ref mut stdin) = child.stdin {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| SandboxError::ExecTransport(e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| SandboxError::ExecTransport(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::ExecTransport(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::WriteFailed {
                path: path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn file_exists(&self, snapshot: &str, path: &str) -> Result<bool, SandboxError> {
        validate_snapshot_name(snapshot)?;
        validate_rel_path(path)?;
        let cmd = format!("test -f '{WORK_DIR}/{snapshot}/{path}'");
        let out = self.raw_exec(&cmd, Duration::from_secs(10)).await?;
        Ok(out.exit_code == 0)
    }

    async fn fork(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        validate_snapshot_name(from)?;
        validate_snapshot_name(to)?;
        let cmd = format!("rm -rf {WORK_DIR}/{to} && cp -a {WORK_DIR}/{from} {WORK_DIR}/{to}");
        let out = self.raw_exec(&cmd, Duration::from_secs(120)).await?;
        if !out.success() {
            if out.stderr.contains("No such file") {
                return Err(SandboxError::SnapshotNotFound(from.to_string()));
            }
            return Err(SandboxError::ExecTransport(out.stderr));
        }
        Ok(())
    }

    async fn remove(&self, snapshot: &str) -> Result<(), SandboxError> {
        validate_snapshot_name(snapshot)?;
        let cmd = format!("rm -rf {WORK_DIR}/{snapshot}");
        let out = self.raw_exec(&cmd, Duration::from_secs(60)).await?;
        if !out.success() {
            return Err(SandboxError::ExecTransport(out.stderr));
        }
        Ok(())
    }
}

/// Best-effort synchronous cleanup when the sandbox is dropped.
impl Drop for DockerSandbox {
    fn drop(&mut self) {
        let name = self.container_name.clone();
        std::thread::spawn(move || {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", &name])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        });
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn container_names_are_unique() {
        // Name generation only; no daemon interaction.
        let a = format!("bugforge-{}", uuid::Uuid::new_v4().simple());
        let b = format!("bugforge-{}", uuid::Uuid::new_v4().simple());
        assert_ne!(a, b);
    }
}
