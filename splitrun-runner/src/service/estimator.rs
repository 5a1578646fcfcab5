//! Resource estimation
//!
//! Decides how many workers this host can run for a job category. The
//! estimate is a pure function of the category and a budget snapshot taken
//! once per run.

use anyhow::{Context, Result};
use splitrun_core::domain::{JobCategory, ResourceBudget};
use splitrun_core::Error;
use tracing::{info, warn};

/// Computes the worker count for a run
pub struct ResourceEstimator;

impl ResourceEstimator {
    /// Maximum number of concurrent workers for `category` on `budget`
    ///
    /// Single-worker categories either fit (1) or fail with
    /// `InsufficientResources`. Splittable categories take the smaller of a
    /// core bound and a memory bound, never less than one:
    /// - cores: `floor(sqrt(cpu / tenancy))`, since every worker parallelizes
    ///   internally and plain core division would over-commit
    /// - memory: `floor(memory / (min_memory * tenancy))`
    pub fn estimate(
        category: &JobCategory,
        budget: &ResourceBudget,
    ) -> splitrun_core::Result<usize> {
        let tenancy = budget.tenancy_factor();
        let required = category.min_memory_bytes.saturating_mul(tenancy);

        if !category.splittable {
            if budget.memory_bytes() < required {
                return Err(Error::InsufficientResources {
                    category: category.name.to_string(),
                    required,
                    available: budget.memory_bytes(),
                    tenancy,
                });
            }
            return Ok(1);
        }

        let by_cores = (budget.cpu_count() / tenancy).isqrt();
        let by_memory = budget.memory_bytes() / required.max(1);

        let workers = by_cores
            .min(by_memory)
            .min(category.max_workers as u64)
            .max(1);

        Ok(workers as usize)
    }

    /// Applies the worker-count policy override on top of the estimate
    ///
    /// The estimate always runs first so preflight failures are never
    /// skipped. Single-worker categories stay at one worker regardless of
    /// the override.
    pub fn resolve(
        category: &JobCategory,
        budget: &ResourceBudget,
        requested: Option<usize>,
    ) -> splitrun_core::Result<usize> {
        let estimated = Self::estimate(category, budget)?;

        let workers = match requested {
            None => estimated,
            Some(0) => return Err(Error::InvalidWorkerCount(0)),
            Some(n) if !category.splittable => {
                if n > 1 {
                    warn!(
                        "Category '{}' cannot be split; ignoring worker override of {}",
                        category.name, n
                    );
                }
                1
            }
            Some(n) => {
                if n != estimated {
                    info!(
                        "Worker override {} replaces estimate {} for category '{}'",
                        n, estimated, category.name
                    );
                }
                n
            }
        };

        Ok(workers)
    }
}

/// Snapshots the host's CPU count and total memory
pub fn detect_budget(tenancy_factor: u64) -> Result<ResourceBudget> {
    let cpu_count = std::thread::available_parallelism()
        .context("Failed to determine CPU count")?
        .get() as u64;

    let meminfo =
        std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
    let memory_bytes = ResourceBudget::parse_meminfo(&meminfo)
        .context("MemTotal missing from /proc/meminfo")?;

    let budget = ResourceBudget::new(cpu_count, memory_bytes, tenancy_factor)?;
    info!(
        "Host budget: {} cpus, {} MiB memory, tenancy factor {}",
        budget.cpu_count(),
        budget.memory_bytes() / (1024 * 1024),
        budget.tenancy_factor()
    );
    Ok(budget)
}
