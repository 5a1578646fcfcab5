//! Run orchestration
//!
//! Drives one partitioned run from preflight to aggregated result:
//! estimate, plan, acquire the image, launch every worker, then wait for
//! all of them. Everything started here is owned by a `TeardownGuard`
//! that lives as long as the run future, so dropping the future on
//! interrupt releases every sandbox.

use anyhow::{Context, Result};
use splitrun_core::domain::{ResourceBudget, RunResult, SplitSpec, WorkerIdentity};
use splitrun_core::selection::Selection;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::{Config, Mount, SANDBOX_SELECTION_FILE};
use crate::job::WorkerJob;
use crate::podman::SandboxRuntime;
use crate::scheduler::TeardownGuard;
use crate::service::{
    CompletionAggregator, ImageSource, LaunchSettings, LogStreamer, ResourceEstimator,
    SplitPlanner, WorkerLauncher, acquire_image,
};

/// File the run result is written to, inside the output directory
pub const RUN_RESULT_FILE: &str = "run-result.json";

/// Runs partitioned test jobs
pub struct Orchestrator {
    config: Config,
    runtime: Arc<dyn SandboxRuntime>,
    images: Arc<dyn ImageSource>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        runtime: Arc<dyn SandboxRuntime>,
        images: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            config,
            runtime,
            images,
        }
    }

    /// Executes the run on `budget`
    ///
    /// Errors are preflight errors; once workers are launched every failure
    /// is reported through the returned `RunResult` instead.
    pub async fn run(&self, budget: ResourceBudget) -> Result<RunResult> {
        let config = &self.config;
        let category = config.job_category()?;
        let outer = config.outer_split()?;

        let worker_count = ResourceEstimator::resolve(category, &budget, config.workers)?;
        let splits = SplitPlanner::plan(outer, worker_count)?;
        info!(
            "Running category '{}' split {} with {} worker(s)",
            category.name, outer, worker_count
        );

        acquire_image(
            self.images.as_ref(),
            &config.image,
            config.image_retry_delay,
        )
        .await
        .with_context(|| format!("Failed to acquire image {}", config.image))?;

        config.prepare_dirs()?;
        let selection = self.load_selection()?;

        let launcher = WorkerLauncher::new(
            Arc::clone(&self.runtime),
            LaunchSettings {
                category,
                target: config.target.clone(),
                version: config.version.clone(),
                image: config.image.clone(),
                command: config.command.clone(),
                log_dir: config.log_dir.clone(),
                budget,
                worker_count,
            },
        );

        let guard = TeardownGuard::new(Arc::clone(&self.runtime));
        let mut jobs = Vec::with_capacity(splits.len());

        for (i, split) in splits.into_iter().enumerate() {
            let identity = launcher.identity(i + 1);
            let log_path = launcher.log_path(&identity);

            let (env, mounts) = match self.worker_inputs(&identity, &split, selection.as_ref()) {
                Ok(inputs) => inputs,
                Err(e) => {
                    error!("Failed to prepare worker {}: {:#}", identity, e);
                    let reason = format!("{:#}", e);
                    jobs.push(WorkerJob::launch_failed(identity, split, log_path, reason));
                    continue;
                }
            };

            match launcher.launch(&guard, identity.clone(), split, &env, &mounts).await {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    error!("{}", e);
                    jobs.push(WorkerJob::launch_failed(identity, split, log_path, e));
                }
            }
        }

        info!("{} worker(s) submitted, waiting for completion", jobs.len());

        let aggregator = CompletionAggregator::new(
            Arc::clone(&self.runtime),
            LogStreamer::new(config.log_poll_interval),
            config.artifacts.clone(),
            config.output_dir.clone(),
            config.diagnostic_tail_lines,
        );
        let result = aggregator.aggregate(&mut jobs, &guard).await;

        if let Err(e) = self.write_result(&result) {
            error!("Failed to write run result: {:#}", e);
        }

        Ok(result)
    }

    fn load_selection(&self) -> Result<Option<Selection>> {
        let Some(path) = &self.config.selection else {
            return Ok(None);
        };

        let selection = Selection::from_file(path)
            .with_context(|| format!("Failed to read selection {}", path.display()))?;
        info!(
            "Loaded {} selected test(s) from {}",
            selection.len(),
            path.display()
        );

        std::fs::create_dir_all(self.selection_dir())
            .with_context(|| format!("Failed to create {}", self.selection_dir().display()))?;

        Ok(Some(selection))
    }

    fn selection_dir(&self) -> PathBuf {
        self.config.work_dir.join("selection")
    }

    /// Environment and mounts for one worker
    ///
    /// With a selection, the worker's slice is written to its own file and
    /// mounted read-only at a fixed in-sandbox path.
    fn worker_inputs(
        &self,
        identity: &WorkerIdentity,
        split: &SplitSpec,
        selection: Option<&Selection>,
    ) -> Result<(Vec<(String, String)>, Vec<Mount>)> {
        let mut env = self.config.env.clone();
        let mut mounts = self.config.mounts.clone();

        if let Some(selection) = selection {
            let path = self
                .selection_dir()
                .join(format!("{}.txt", identity.name()));
            std::fs::write(&path, selection.render(split))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!(
                "Worker {} gets {} selected test(s)",
                identity,
                selection.slice(split).len()
            );

            let host = std::path::absolute(&path)
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            mounts.push(Mount {
                host,
                container: SANDBOX_SELECTION_FILE.to_string(),
                read_only: true,
            });
            env.push((
                "SPLITRUN_SELECTION".to_string(),
                SANDBOX_SELECTION_FILE.to_string(),
            ));
        }

        Ok((env, mounts))
    }

    fn write_result(&self, result: &RunResult) -> Result<()> {
        let path = self.config.output_dir.join(RUN_RESULT_FILE);
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Run result written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::image::ImageError;
    use crate::testing::FakeRuntime;
    use async_trait::async_trait;
    use splitrun_core::Error;
    use splitrun_core::domain::budget::GIB;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingImages {
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageSource for RecordingImages {
        async fn ensure(&self, tag: &str) -> Result<(), ImageError> {
            self.requested.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    fn config(root: &std::path::Path, category: &str, split: &str, command: &str) -> Config {
        let mut config = Config::new(
            category.to_string(),
            split.to_string(),
            "localhost/worker:test".to_string(),
            command.to_string(),
        );
        config.output_dir = root.join("output");
        config.log_dir = root.join("logs");
        config.work_dir = root.join("work");
        config.log_poll_interval = Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn test_insufficient_memory_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let images = Arc::new(RecordingImages::default());
        let orchestrator = Orchestrator::new(
            config(dir.path(), "heavy-resource", "1/1", "true"),
            runtime.clone(),
            images.clone(),
        );

        let err = orchestrator
            .run(ResourceBudget::new(8, 8 * GIB, 1).unwrap())
            .await
            .unwrap_err();

        let core = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(core, Error::InsufficientResources { .. }));
        assert!(core.is_preflight());
        assert!(runtime.started().is_empty());
        assert!(images.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_partitions_outer_split() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let orchestrator = Orchestrator::new(
            config(dir.path(), "standard", "2/3", "echo \"$SPLITRUN_SPLIT\""),
            runtime.clone(),
            Arc::new(RecordingImages::default()),
        );

        // 16 cores, 64 GiB: four workers
        let result = orchestrator
            .run(ResourceBudget::new(16, 64 * GIB, 1).unwrap())
            .await
            .unwrap();

        assert!(result.success());
        let splits: Vec<String> = result
            .per_worker()
            .iter()
            .map(|o| o.split.to_string())
            .collect();
        assert_eq!(splits, ["5/12", "6/12", "7/12", "8/12"]);
        assert_eq!(runtime.started().len(), 4);
        assert_eq!(runtime.removed().len(), 4);

        let written =
            std::fs::read_to_string(dir.path().join("output").join(RUN_RESULT_FILE)).unwrap();
        let parsed: RunResult = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.overall_exit_code(), 0);
        assert_eq!(parsed.per_worker().len(), 4);

        for outcome in result.per_worker() {
            let log = dir
                .path()
                .join("logs")
                .join(format!("{}.log", outcome.worker));
            assert_eq!(
                std::fs::read_to_string(log).unwrap().trim(),
                outcome.split.to_string()
            );
        }
    }

    #[tokio::test]
    async fn test_worker_override_and_selection() {
        let dir = tempfile::tempdir().unwrap();
        let selection = dir.path().join("tests.txt");
        std::fs::write(&selection, "a\nb\nc\nd\n").unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let mut config = config(dir.path(), "standard", "1/1", "true");
        config.workers = Some(2);
        config.selection = Some(selection);
        let orchestrator = Orchestrator::new(
            config,
            runtime.clone(),
            Arc::new(RecordingImages::default()),
        );

        let result = orchestrator
            .run(ResourceBudget::new(64, 256 * GIB, 1).unwrap())
            .await
            .unwrap();

        assert_eq!(result.per_worker().len(), 2);
        let first = &result.per_worker()[0].worker;
        let written = std::fs::read_to_string(
            dir.path()
                .join("work")
                .join("selection")
                .join(format!("{}.txt", first)),
        )
        .unwrap();
        assert_eq!(written, "a\nb\n");

        let request = runtime.request(first).unwrap();
        assert!(
            request
                .mounts
                .iter()
                .any(|m| m.container == SANDBOX_SELECTION_FILE && m.read_only)
        );
        assert!(
            request
                .env
                .contains(&("SPLITRUN_SELECTION".to_string(), SANDBOX_SELECTION_FILE.to_string()))
        );
    }

    #[tokio::test]
    async fn test_launch_failure_still_drains_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        runtime.fail_start_matching("-p2-");
        let mut config = config(dir.path(), "standard", "1/1", "exit 0");
        config.workers = Some(3);
        let orchestrator = Orchestrator::new(
            config,
            runtime.clone(),
            Arc::new(RecordingImages::default()),
        );

        let result = orchestrator
            .run(ResourceBudget::new(64, 256 * GIB, 1).unwrap())
            .await
            .unwrap();

        let codes: Vec<i32> = result.per_worker().iter().map(|o| o.exit_code).collect();
        assert_eq!(codes, [0, 125, 0]);
        assert_eq!(result.overall_exit_code(), 125);
        assert_eq!(runtime.removed().len(), 3);
    }

    #[tokio::test]
    async fn test_dropping_run_tears_down_live_workers() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let mut config = config(dir.path(), "standard", "1/1", "sleep 30");
        config.workers = Some(3);
        let orchestrator = Orchestrator::new(
            config,
            runtime.clone(),
            Arc::new(RecordingImages::default()),
        );

        let run = orchestrator.run(ResourceBudget::new(64, 256 * GIB, 1).unwrap());
        let outcome = tokio::time::timeout(Duration::from_secs(1), run).await;
        assert!(outcome.is_err(), "run finished while workers were sleeping");

        let mut started = runtime.started();
        let mut removed = runtime.removed();
        started.sort();
        removed.sort();
        assert_eq!(started.len(), 3);
        assert_eq!(removed, started);
        assert!(!dir.path().join("output").join(RUN_RESULT_FILE).exists());
    }
}
