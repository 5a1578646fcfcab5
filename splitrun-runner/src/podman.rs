//! Podman sandbox management
//!
//! Handles the sandbox lifecycle for partition workers:
//! - Starting a detached sandbox with mounts, environment and limits
//! - Running the worker command inside it as a background process
//! - Gathering metadata and logs for diagnostics
//! - Copying artifacts out of the sandbox
//! - Stopping and removing the sandbox, async or from a `Drop`

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::Mount;

/// Resource limits applied to one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    /// CPU quota, `None` for uncapped categories
    pub cpus: Option<f64>,
    /// Memory cap; swap is capped to the same value
    pub memory_bytes: u64,
}

/// Everything needed to start one sandbox
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub limits: SandboxLimits,
}

/// Container engine operations used by the orchestrator
///
/// Trait-based so the aggregator and launcher can be exercised without a
/// container engine.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Starts a detached sandbox and returns its engine id
    async fn start(&self, request: &SandboxRequest) -> Result<String>;

    /// Runs `command` inside the sandbox as a background child process
    ///
    /// Both output streams are written to `log`. The child is placed in its
    /// own process group so it can be torn down as a whole.
    async fn spawn_worker(&self, name: &str, command: &str, log: std::fs::File) -> Result<Child>;

    /// Engine metadata for the sandbox
    async fn inspect(&self, name: &str) -> Result<String>;

    /// Last `lines` lines of the sandbox's own log
    async fn logs_tail(&self, name: &str, lines: usize) -> Result<String>;

    /// Copies `source` out of the sandbox to `dest`
    ///
    /// Returns `Ok(false)` when the source does not exist.
    async fn copy_out(&self, name: &str, source: &str, dest: &Path) -> Result<bool>;

    /// Stops and removes the sandbox; succeeds if it is already gone
    async fn remove(&self, name: &str) -> Result<()>;

    /// Blocking variant of [`SandboxRuntime::remove`] for teardown from `Drop`
    fn remove_blocking(&self, name: &str);
}

/// Checks if podman is installed and available
pub fn check_podman_available() -> Result<()> {
    let output = std::process::Command::new("podman")
        .arg("--version")
        .output()
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Podman-backed sandbox runtime
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: PathBuf,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("podman"),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null());
        command
    }

    /// Builds the `podman run` argument list for a request
    fn run_args(request: &SandboxRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            request.name.clone(),
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
        ];

        if let Some(cpus) = request.limits.cpus {
            args.push(format!("--cpus={:.2}", cpus));
        }
        args.push(format!("--memory={}b", request.limits.memory_bytes));
        args.push(format!("--memory-swap={}b", request.limits.memory_bytes));

        for mount in &request.mounts {
            args.push("-v".to_string());
            args.push(mount.to_volume_arg());
        }

        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Keep the sandbox alive; the worker command runs through exec
        args.push(request.image.clone());
        args.push("-c".to_string());
        args.push("sleep infinity".to_string());
        args
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for PodmanRuntime {
    async fn start(&self, request: &SandboxRequest) -> Result<String> {
        info!(
            "Creating sandbox {} from image {}",
            request.name, request.image
        );

        let output = self
            .command()
            .args(Self::run_args(request))
            .output()
            .await
            .context("Failed to execute podman run command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("podman run stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let error_msg = format!(
                "Failed to start sandbox {}: exit_code={}, stderr='{}'",
                request.name,
                exit_code,
                stderr.trim()
            );
            error!("{}", error_msg);
            anyhow::bail!("{}", error_msg);
        }

        let container_id = stdout.trim().to_string();
        info!(
            "Sandbox {} started with ID: {}",
            request.name, container_id
        );
        Ok(container_id)
    }

    async fn spawn_worker(&self, name: &str, command: &str, log: std::fs::File) -> Result<Child> {
        let stderr = log.try_clone().context("Failed to clone log file handle")?;

        debug!("Executing in sandbox {}: {}", name, command);

        let child = self
            .command()
            .arg("exec")
            .arg(name)
            .arg("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .context("Failed to execute podman exec command")?;

        Ok(child)
    }

    async fn inspect(&self, name: &str) -> Result<String> {
        let output = self
            .command()
            .arg("inspect")
            .arg(name)
            .output()
            .await
            .context("Failed to execute podman inspect")?;

        if !output.status.success() {
            anyhow::bail!(
                "podman inspect {} failed: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn logs_tail(&self, name: &str, lines: usize) -> Result<String> {
        let output = self
            .command()
            .arg("logs")
            .arg("--tail")
            .arg(lines.to_string())
            .arg(name)
            .output()
            .await
            .context("Failed to execute podman logs")?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn copy_out(&self, name: &str, source: &str, dest: &Path) -> Result<bool> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let output = self
            .command()
            .arg("cp")
            .arg(format!("{}:{}", name, source))
            .arg(dest)
            .output()
            .await
            .context("Failed to execute podman cp")?;

        if !output.status.success() {
            debug!(
                "Nothing copied from {}:{}: {}",
                name,
                source,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }

        Ok(true)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        debug!("Stopping sandbox {}", name);

        let output = self
            .command()
            .args(["rm", "--force", "--ignore", "--time", "10"])
            .arg(name)
            .output()
            .await
            .context("Failed to execute podman rm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Failed to remove sandbox {}: {}", name, stderr.trim());
            anyhow::bail!("podman rm {} failed: {}", name, stderr.trim());
        }

        debug!("Sandbox {} removed", name);
        Ok(())
    }

    fn remove_blocking(&self, name: &str) {
        let rm_output = std::process::Command::new(&self.binary)
            .args(["rm", "--force", "--ignore", "--time", "0"])
            .arg(name)
            .stdin(Stdio::null())
            .output();

        match rm_output {
            Ok(output) if output.status.success() => {
                debug!("Sandbox {} removed", name);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Failed to remove sandbox {}: {}", name, stderr.trim());
            }
            Err(e) => {
                warn!("Failed to remove sandbox {}: {}", name, e);
            }
        }
    }
}
