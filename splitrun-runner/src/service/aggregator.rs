//! Completion aggregation
//!
//! Supervises every launched worker until it finishes and folds the results
//! into one `RunResult`. Per worker, one task waits on the process and one
//! task streams its log; completion of the first stops the second. Workers
//! are drained in submission order so output and exit-code precedence do
//! not depend on which worker happens to finish first.

use colored::*;
use splitrun_core::domain::{RunResult, WorkerOutcome, WorkerStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::config::ArtifactSource;
use crate::job::WorkerJob;
use crate::podman::SandboxRuntime;
use crate::scheduler::TeardownGuard;
use crate::service::diagnostics::DiagnosticBundle;
use crate::service::log_stream::LogStreamer;

/// Exit code recorded when a worker's exit status cannot be determined
const UNKNOWN_EXIT_CODE: i32 = 1;

/// Supervision handles for one worker
struct Supervision {
    wait: AbortOnDropHandle<i32>,
    follow: AbortOnDropHandle<()>,
}

/// Waits for workers and aggregates their results
pub struct CompletionAggregator {
    runtime: Arc<dyn SandboxRuntime>,
    streamer: LogStreamer,
    artifacts: Vec<ArtifactSource>,
    output_dir: PathBuf,
    diagnostic_tail_lines: usize,
}

impl CompletionAggregator {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        streamer: LogStreamer,
        artifacts: Vec<ArtifactSource>,
        output_dir: PathBuf,
        diagnostic_tail_lines: usize,
    ) -> Self {
        Self {
            runtime,
            streamer,
            artifacts,
            output_dir,
            diagnostic_tail_lines,
        }
    }

    /// Drains every job and builds the run result
    ///
    /// A failed worker never stops the others from being drained. Every
    /// sandbox is removed and released from `guard`, whatever its outcome.
    pub async fn aggregate(&self, jobs: &mut [WorkerJob], guard: &TeardownGuard) -> RunResult {
        // Supervision starts for all workers before the first wait
        let supervision: Vec<Option<Supervision>> =
            jobs.iter_mut().map(|job| self.supervise(job, guard)).collect();

        let mut outcomes = Vec::with_capacity(jobs.len());

        for (job, supervision) in jobs.iter_mut().zip(supervision) {
            let exit_code = match supervision {
                Some(Supervision { wait, follow }) => {
                    let code = match wait.await {
                        Ok(code) => code,
                        Err(e) => {
                            error!("Wait task for worker {} failed: {}", job.name(), e);
                            UNKNOWN_EXIT_CODE
                        }
                    };
                    if let Err(e) = follow.await {
                        debug!("Log follower for worker {} ended abnormally: {}", job.name(), e);
                    }
                    job.record_exit(code);
                    code
                }
                None => {
                    let code = job.status().exit_code().unwrap_or(UNKNOWN_EXIT_CODE);
                    error!(
                        "Worker {} never started: {}",
                        job.name(),
                        job.launch_error().unwrap_or("unknown error")
                    );
                    code
                }
            };

            let artifacts = if job.status() == WorkerStatus::Succeeded {
                self.collect_artifacts(job).await
            } else {
                Vec::new()
            };

            self.release(job, guard).await;

            outcomes.push(WorkerOutcome {
                worker: job.name(),
                split: job.split,
                exit_code,
                artifacts,
            });
        }

        RunResult::from_outcomes(outcomes)
    }

    /// Spawns the wait and follow tasks for a running job
    fn supervise(&self, job: &mut WorkerJob, guard: &TeardownGuard) -> Option<Supervision> {
        let child = job.take_process()?;
        let done = CancellationToken::new();

        let follow = {
            let streamer = self.streamer;
            let path = job.log_path.clone();
            let done = done.clone();
            let prefix = format!("[{}]", job.label());
            AbortOnDropHandle::new(tokio::spawn(async move {
                let emit = |line: &str| println!("{} {}", prefix.cyan(), line);
                if let Err(e) = streamer.follow(&path, done, emit).await {
                    warn!("Failed to follow {}: {}", path.display(), e);
                }
            }))
        };

        let wait = {
            let runtime = Arc::clone(&self.runtime);
            let name = job.name();
            let log_path = job.log_path.clone();
            let tail_lines = self.diagnostic_tail_lines;
            let tracker = guard.process_tracker();
            AbortOnDropHandle::new(tokio::spawn(async move {
                let code = wait_for_exit(child, &name).await;
                // Reaped: its group id may be reused from here on
                tracker.detach_process(&name);
                done.cancel();

                if code != 0 {
                    let bundle = DiagnosticBundle::gather(
                        runtime.as_ref(),
                        &name,
                        code,
                        &log_path,
                        tail_lines,
                    )
                    .await;
                    bundle.print();
                } else {
                    info!("Worker {} succeeded", name);
                }
                code
            }))
        };

        Some(Supervision { wait, follow })
    }

    /// Copies every artifact kind the worker produced
    ///
    /// Absent artifacts are expected: not every category produces every kind.
    async fn collect_artifacts(&self, job: &WorkerJob) -> Vec<PathBuf> {
        let name = job.name();
        let mut collected = Vec::new();

        for artifact in &self.artifacts {
            let dest = self.output_dir.join(&artifact.kind).join(&name);
            match self.runtime.copy_out(&name, &artifact.source, &dest).await {
                Ok(true) => {
                    debug!("Collected {} for worker {}", artifact.kind, name);
                    collected.push(dest);
                }
                Ok(false) => {
                    debug!("Worker {} produced no {}", name, artifact.kind);
                }
                Err(e) => {
                    warn!(
                        "Failed to collect {} for worker {}: {:#}",
                        artifact.kind, name, e
                    );
                }
            }
        }

        collected
    }

    /// Stops and removes the job's sandbox
    async fn release(&self, job: &WorkerJob, guard: &TeardownGuard) {
        if job.sandbox.is_none() {
            return;
        }

        let name = job.name();
        match self.runtime.remove(&name).await {
            Ok(()) => guard.release(&name),
            // Still registered, so the guard retries on drop
            Err(e) => warn!("Failed to remove sandbox {}: {:#}", name, e),
        }
    }
}

async fn wait_for_exit(mut child: Child, name: &str) -> i32 {
    match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("Failed to wait for worker {}: {}", name, e);
            UNKNOWN_EXIT_CODE
        }
    }
}

/// Numeric exit code; termination by signal maps to `128 + signal`
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_artifacts;
    use crate::service::launcher::{LaunchSettings, WorkerLauncher};
    use crate::testing::FakeRuntime;
    use splitrun_core::domain::budget::GIB;
    use splitrun_core::domain::{JobCategory, ResourceBudget, SplitSpec};
    use std::time::Duration;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        launcher: WorkerLauncher,
        aggregator: CompletionAggregator,
        output: tempfile::TempDir,
        _logs: tempfile::TempDir,
    }

    fn harness(command: &str, worker_count: usize) -> Harness {
        let runtime = Arc::new(FakeRuntime::with_artifacts(&[
            "/splitrun/out/test-results",
            "/splitrun/out/logs",
        ]));
        let logs = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        let launcher = WorkerLauncher::new(
            runtime.clone(),
            LaunchSettings {
                category: JobCategory::lookup("standard").unwrap(),
                target: "jdk17".to_string(),
                version: "5.1".to_string(),
                image: "worker".to_string(),
                command: command.to_string(),
                log_dir: logs.path().to_path_buf(),
                budget: ResourceBudget::new(16, 32 * GIB, 1).unwrap(),
                worker_count,
            },
        );
        let aggregator = CompletionAggregator::new(
            runtime.clone(),
            LogStreamer::new(Duration::from_millis(5)),
            default_artifacts(),
            output.path().to_path_buf(),
            20,
        );

        Harness {
            runtime,
            launcher,
            aggregator,
            output,
            _logs: logs,
        }
    }

    async fn launch_all(h: &Harness, guard: &TeardownGuard, count: usize) -> Vec<WorkerJob> {
        let mut jobs = Vec::new();
        for partition in 1..=count {
            let split = SplitSpec::new(partition, count).unwrap();
            let job = h
                .launcher
                .launch(guard, h.launcher.identity(partition), split, &[], &[])
                .await
                .unwrap();
            jobs.push(job);
        }
        jobs
    }

    #[tokio::test]
    async fn test_middle_worker_failure() {
        let h = harness(
            "echo \"running $SPLITRUN_SPLIT\"; [ \"$SPLITRUN_PARTITION\" = 2 ] && exit 3; exit 0",
            3,
        );
        let guard = TeardownGuard::new(h.runtime.clone());
        let mut jobs = launch_all(&h, &guard, 3).await;
        let names: Vec<String> = jobs.iter().map(WorkerJob::name).collect();

        let result = h.aggregator.aggregate(&mut jobs, &guard).await;

        assert_eq!(result.overall_exit_code(), 3);
        let codes: Vec<i32> = result.per_worker().iter().map(|o| o.exit_code).collect();
        assert_eq!(codes, [0, 3, 0]);

        // Diagnostics only for the failed worker
        assert_eq!(h.runtime.inspected(), [names[1].clone()]);

        // Artifacts only for the successful ones, absent kinds tolerated
        assert_eq!(result.per_worker()[0].artifacts.len(), 2);
        assert!(result.per_worker()[1].artifacts.is_empty());
        assert_eq!(result.per_worker()[2].artifacts.len(), 2);
        assert!(
            h.output
                .path()
                .join("test-results")
                .join(&names[0])
                .join("copied.txt")
                .is_file()
        );
        let copied_from: Vec<String> = h.runtime.copied().into_iter().map(|(n, _)| n).collect();
        assert!(!copied_from.contains(&names[1]));

        // Every sandbox stopped
        let mut removed = h.runtime.removed();
        removed.sort();
        let mut expected = names.clone();
        expected.sort();
        assert_eq!(removed, expected);
        assert_eq!(guard.live_count(), 0);

        assert_eq!(jobs[0].status(), WorkerStatus::Succeeded);
        assert_eq!(jobs[1].status(), WorkerStatus::Failed(3));
        assert_eq!(jobs[2].status(), WorkerStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_first_failure_in_submission_order_wins() {
        // Worker 1 fails late with 4, worker 3 fails early with 9
        let h = harness(
            "case \"$SPLITRUN_PARTITION\" in 1) sleep 0.3; exit 4;; 3) exit 9;; esac; exit 0",
            3,
        );
        let guard = TeardownGuard::new(h.runtime.clone());
        let mut jobs = launch_all(&h, &guard, 3).await;

        let result = h.aggregator.aggregate(&mut jobs, &guard).await;

        assert_eq!(result.overall_exit_code(), 4);
        let codes: Vec<i32> = result.per_worker().iter().map(|o| o.exit_code).collect();
        assert_eq!(codes, [4, 0, 9]);
        assert_eq!(h.runtime.inspected().len(), 2);
    }

    #[tokio::test]
    async fn test_exited_worker_process_group_is_forgotten() {
        let h = harness(
            "[ \"$SPLITRUN_PARTITION\" = 1 ] && sleep 30; exit 0",
            2,
        );
        let guard = TeardownGuard::new(h.runtime.clone());
        let mut jobs = launch_all(&h, &guard, 2).await;
        let names: Vec<String> = jobs.iter().map(WorkerJob::name).collect();
        assert!(guard.process_group(&names[1]).is_some());

        // Worker 1 holds up the in-order drain, worker 2 has long exited
        let drain = h.aggregator.aggregate(&mut jobs, &guard);
        assert!(
            tokio::time::timeout(Duration::from_millis(500), drain)
                .await
                .is_err()
        );

        assert_eq!(guard.process_group(&names[1]), None);
        assert!(guard.process_group(&names[0]).is_some());
        assert_eq!(guard.live_count(), 2);
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let h = harness("echo ok", 2);
        let guard = TeardownGuard::new(h.runtime.clone());
        let mut jobs = launch_all(&h, &guard, 2).await;

        let result = h.aggregator.aggregate(&mut jobs, &guard).await;

        assert!(result.success());
        assert!(h.runtime.inspected().is_empty());
        assert_eq!(h.runtime.removed().len(), 2);
    }

    #[tokio::test]
    async fn test_launch_failed_job_is_reported_without_sandbox() {
        let h = harness("exit 0", 2);
        let guard = TeardownGuard::new(h.runtime.clone());
        let mut jobs = launch_all(&h, &guard, 1).await;

        let identity = h.launcher.identity(2);
        let log_path = h.launcher.log_path(&identity);
        jobs.push(WorkerJob::launch_failed(
            identity,
            SplitSpec::new(2, 2).unwrap(),
            log_path,
            "image missing",
        ));

        let result = h.aggregator.aggregate(&mut jobs, &guard).await;

        assert_eq!(result.overall_exit_code(), 125);
        assert_eq!(h.runtime.removed(), [jobs[0].name()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_exit_code() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(3 << 8)), 3);
    }
}
