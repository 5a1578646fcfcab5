//! Error types for splitrun

use thiserror::Error;

/// Result type alias for splitrun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while planning or launching a partitioned run
///
/// Everything except `WorkerLaunchFailed` is a preflight error: it is raised
/// before any worker is started and aborts the whole run.
#[derive(Debug, Error)]
pub enum Error {
    /// The host cannot hold even one worker of the requested category
    #[error(
        "Insufficient resources for category '{category}': {required} bytes required \
         for {tenancy} tenant(s), {available} bytes available"
    )]
    InsufficientResources {
        /// Category being estimated
        category: String,
        /// Memory threshold compared against, per-worker minimum times tenancy
        required: u64,
        /// Host memory in bytes
        available: u64,
        /// Number of orchestrators sharing the host
        tenancy: u64,
    },

    /// A `K/N` descriptor could not be parsed or is out of range
    #[error("Invalid split format: {0}")]
    InvalidSplitFormat(String),

    /// Worker count of zero requested
    #[error("Invalid worker count: {0}")]
    InvalidWorkerCount(usize),

    /// A resource budget with a zero field
    #[error("Invalid resource budget: {0}")]
    InvalidBudget(String),

    /// No entry in the category table
    #[error("Unknown job category: {0}")]
    UnknownCategory(String),

    /// The sandbox or its worker process could not be started
    #[error("Failed to launch worker {worker}: {reason}")]
    WorkerLaunchFailed {
        /// Worker name
        worker: String,
        /// Underlying failure
        reason: String,
    },
}

impl Error {
    /// Create a launch failure for a worker
    pub fn launch_failed(worker: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::WorkerLaunchFailed {
            worker: worker.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error aborts the run before any worker launches
    pub fn is_preflight(&self) -> bool {
        !matches!(self, Self::WorkerLaunchFailed { .. })
    }
}
