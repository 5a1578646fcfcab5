//! Aggregated run result

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::split::SplitSpec;

/// What one worker reported back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    /// Worker name
    pub worker: String,
    pub split: SplitSpec,
    pub exit_code: i32,
    /// Host paths of the artifacts collected from the sandbox
    pub artifacts: Vec<PathBuf>,
}

/// Final result of a partitioned run
///
/// Built once after every worker has been drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    overall_exit_code: i32,
    per_worker: Vec<WorkerOutcome>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Folds outcomes, given in submission order, into one result
    ///
    /// The overall code is the first non-zero code in submission order, so
    /// later failures are reported but never change the surfaced code.
    pub fn from_outcomes(per_worker: Vec<WorkerOutcome>) -> Self {
        let overall_exit_code = per_worker
            .iter()
            .map(|outcome| outcome.exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0);

        Self {
            overall_exit_code,
            per_worker,
            finished_at: Utc::now(),
        }
    }

    pub fn overall_exit_code(&self) -> i32 {
        self.overall_exit_code
    }

    pub fn per_worker(&self) -> &[WorkerOutcome] {
        &self.per_worker
    }

    pub fn success(&self) -> bool {
        self.overall_exit_code == 0
    }
}
