//! Worker jobs
//!
//! A `WorkerJob` only exists while a run is in flight. It is created by the
//! launcher, its status is moved to a terminal state by the aggregator, and
//! its sandbox is released once aggregation has drained it.

use splitrun_core::domain::worker::LAUNCH_FAILURE_CODE;
use splitrun_core::domain::{SplitSpec, WorkerIdentity, WorkerStatus};
use std::path::PathBuf;
use tokio::process::Child;

/// One launched (or failed-to-launch) partition worker
#[derive(Debug)]
pub struct WorkerJob {
    pub identity: WorkerIdentity,
    pub split: SplitSpec,
    /// Engine id of the sandbox, absent if it never started
    pub sandbox: Option<String>,
    /// Combined stdout/stderr of the worker command
    pub log_path: PathBuf,
    status: WorkerStatus,
    /// Background worker process, owned exclusively until the aggregator takes it
    process: Option<Child>,
    launch_error: Option<String>,
}

impl WorkerJob {
    /// A job whose sandbox and worker process are up
    pub fn running(
        identity: WorkerIdentity,
        split: SplitSpec,
        sandbox: String,
        log_path: PathBuf,
        process: Child,
    ) -> Self {
        Self {
            identity,
            split,
            sandbox: Some(sandbox),
            log_path,
            status: WorkerStatus::Running,
            process: Some(process),
            launch_error: None,
        }
    }

    /// A job that never got a sandbox
    ///
    /// It is terminal from the start so aggregation reports it like any other
    /// failed worker.
    pub fn launch_failed(
        identity: WorkerIdentity,
        split: SplitSpec,
        log_path: PathBuf,
        error: impl ToString,
    ) -> Self {
        Self {
            identity,
            split,
            sandbox: None,
            log_path,
            status: WorkerStatus::Failed(LAUNCH_FAILURE_CODE),
            process: None,
            launch_error: Some(error.to_string()),
        }
    }

    /// Sandbox name derived from the identity
    pub fn name(&self) -> String {
        self.identity.name()
    }

    /// Short label used to prefix streamed output
    pub fn label(&self) -> String {
        format!("p{} {}", self.identity.partition, self.split)
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn launch_error(&self) -> Option<&str> {
        self.launch_error.as_deref()
    }

    /// Hands the worker process to the task that waits on it
    pub(crate) fn take_process(&mut self) -> Option<Child> {
        self.process.take()
    }

    /// Records the worker's final exit code
    pub(crate) fn record_exit(&mut self, code: i32) {
        self.status = WorkerStatus::from_exit_code(code);
    }
}
