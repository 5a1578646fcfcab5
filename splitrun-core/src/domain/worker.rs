//! Worker domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Exit code recorded for a worker whose sandbox never started
pub const LAUNCH_FAILURE_CODE: i32 = 125;

/// Structured identity of one worker
///
/// The sandbox name is derived from these fields with [`WorkerIdentity::name`];
/// nothing parses it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub category: String,
    pub target: String,
    pub version: String,
    /// 1-based partition index within this run
    pub partition: usize,
    /// Random suffix so concurrent runs on one host never collide
    pub salt: String,
}

impl WorkerIdentity {
    /// Creates an identity with a fresh random salt
    pub fn new(
        category: impl Into<String>,
        target: impl Into<String>,
        version: impl Into<String>,
        partition: usize,
    ) -> Self {
        let salt = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            category: category.into(),
            target: target.into(),
            version: version.into(),
            partition,
            salt,
        }
    }

    /// Container-safe name
    pub fn name(&self) -> String {
        let raw = format!(
            "splitrun-{}-{}-{}-p{}-{}",
            self.category, self.target, self.version, self.partition, self.salt
        );
        sanitize(&raw)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Worker lifecycle: `Pending -> Running -> Succeeded | Failed(code)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Pending,
    Running,
    Succeeded,
    Failed(i32),
}

impl WorkerStatus {
    /// Status for a finished worker with the given exit code
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Succeeded
        } else {
            Self::Failed(code)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }

    /// Exit code of a terminal status
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Succeeded => Some(0),
            Self::Failed(code) => Some(*code),
            Self::Pending | Self::Running => None,
        }
    }
}
