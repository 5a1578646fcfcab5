//! Worker launching
//!
//! Turns one planned split into one running worker: a uniquely named
//! sandbox with the run's mounts, environment and per-worker resource
//! limits, and a background worker process whose output goes to a
//! dedicated log file. Launching returns as soon as the process is spawned.

use splitrun_core::domain::{JobCategory, ResourceBudget, SplitSpec, WorkerIdentity};
use splitrun_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Mount, SANDBOX_OUTPUT_DIR};
use crate::job::WorkerJob;
use crate::podman::{SandboxLimits, SandboxRequest, SandboxRuntime};
use crate::scheduler::TeardownGuard;

/// Fixed per-run launch settings
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub category: &'static JobCategory,
    pub target: String,
    pub version: String,
    pub image: String,
    pub command: String,
    pub log_dir: PathBuf,
    pub budget: ResourceBudget,
    pub worker_count: usize,
}

/// Starts partition workers
pub struct WorkerLauncher {
    runtime: Arc<dyn SandboxRuntime>,
    settings: LaunchSettings,
}

impl WorkerLauncher {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, settings: LaunchSettings) -> Self {
        Self { runtime, settings }
    }

    /// Fresh identity for the worker at `partition` (1-based)
    pub fn identity(&self, partition: usize) -> WorkerIdentity {
        WorkerIdentity::new(
            self.settings.category.name,
            self.settings.target.as_str(),
            self.settings.version.as_str(),
            partition,
        )
    }

    /// Log file of a worker
    pub fn log_path(&self, identity: &WorkerIdentity) -> PathBuf {
        self.settings.log_dir.join(format!("{}.log", identity.name()))
    }

    /// Per-worker share of the budget
    ///
    /// Swap is capped to the memory limit so workers cannot overcommit.
    pub fn limits(&self) -> SandboxLimits {
        let budget = &self.settings.budget;
        let workers = self.settings.worker_count;
        SandboxLimits {
            cpus: self
                .settings
                .category
                .cpu_capped
                .then(|| budget.cpus_per_worker(workers)),
            memory_bytes: budget.memory_per_worker(workers),
        }
    }

    /// Starts the worker for `split`
    ///
    /// # Arguments
    /// * `guard` - Teardown guard the sandbox is registered with
    /// * `identity` - Identity from [`WorkerLauncher::identity`]
    /// * `split` - Inner split this worker runs
    /// * `env` - Extra environment for the sandbox
    /// * `mounts` - Host directories mounted into the sandbox
    pub async fn launch(
        &self,
        guard: &TeardownGuard,
        identity: WorkerIdentity,
        split: SplitSpec,
        env: &[(String, String)],
        mounts: &[Mount],
    ) -> Result<WorkerJob> {
        let name = identity.name();
        let log_path = self.log_path(&identity);

        let log = std::fs::File::create(&log_path)
            .map_err(|e| Error::launch_failed(&name, format!("{}: {}", log_path.display(), e)))?;

        let mut sandbox_env = vec![
            ("SPLITRUN_SPLIT".to_string(), split.to_string()),
            ("SPLITRUN_SPLIT_INDEX".to_string(), split.index().to_string()),
            ("SPLITRUN_SPLIT_TOTAL".to_string(), split.total().to_string()),
            ("SPLITRUN_PARTITION".to_string(), identity.partition.to_string()),
            ("SPLITRUN_WORKER".to_string(), name.clone()),
            ("SPLITRUN_OUTPUT".to_string(), SANDBOX_OUTPUT_DIR.to_string()),
        ];
        sandbox_env.extend(env.iter().cloned());

        let request = SandboxRequest {
            name: name.clone(),
            image: self.settings.image.clone(),
            env: sandbox_env,
            mounts: mounts.to_vec(),
            limits: self.limits(),
        };

        let sandbox = match self.runtime.start(&request).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                // The engine may have created the named sandbox before failing
                if let Err(remove_err) = self.runtime.remove(&name).await {
                    warn!("Failed to remove sandbox {}: {:#}", name, remove_err);
                }
                return Err(Error::launch_failed(&name, format!("{:#}", e)));
            }
        };
        guard.register(&name);

        let process = match self
            .runtime
            .spawn_worker(&name, &self.settings.command, log)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                if let Err(remove_err) = self.runtime.remove(&name).await {
                    warn!("Failed to remove sandbox {}: {:#}", name, remove_err);
                } else {
                    guard.release(&name);
                }
                return Err(Error::launch_failed(&name, format!("{:#}", e)));
            }
        };

        if let Some(pid) = process.id() {
            guard.attach_process(&name, pid);
        }

        info!(
            "Launched worker {} for split {} (log: {})",
            name,
            split,
            log_path.display()
        );

        Ok(WorkerJob::running(identity, split, sandbox, log_path, process))
    }
}
