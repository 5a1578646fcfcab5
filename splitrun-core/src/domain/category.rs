//! Job categories
//!
//! A category decides how much memory each worker needs, whether the
//! selection may be split across several workers, and whether the worker
//! tolerates a fractional CPU quota.

use serde::Serialize;

use super::budget::GIB;
use crate::error::{Error, Result};

/// Static description of a job category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobCategory {
    /// Name used on the command line and in worker names
    pub name: &'static str,
    /// Minimum memory one worker needs, in bytes
    pub min_memory_bytes: u64,
    /// Upper bound on workers that still speeds the category up
    pub max_workers: usize,
    /// Whether the selection may be split across several workers
    pub splittable: bool,
    /// Whether the sandbox gets a `--cpus` quota
    pub cpu_capped: bool,
}

/// Built-in category table
pub const CATEGORIES: &[JobCategory] = &[
    JobCategory {
        name: "standard",
        min_memory_bytes: 5 * GIB,
        max_workers: 16,
        splittable: true,
        cpu_capped: true,
    },
    // Its test harness spins up many threads per core and stalls under a
    // partial-core quota.
    JobCategory {
        name: "long-running",
        min_memory_bytes: 8 * GIB,
        max_workers: 4,
        splittable: true,
        cpu_capped: false,
    },
    JobCategory {
        name: "heavy-resource",
        min_memory_bytes: 15 * GIB,
        max_workers: 1,
        splittable: false,
        cpu_capped: true,
    },
];

impl JobCategory {
    /// Looks up a category by name
    pub fn lookup(name: &str) -> Result<&'static JobCategory> {
        CATEGORIES
            .iter()
            .find(|category| category.name == name)
            .ok_or_else(|| Error::UnknownCategory(name.to_string()))
    }

    /// Names of all known categories
    pub fn names() -> Vec<&'static str> {
        CATEGORIES.iter().map(|category| category.name).collect()
    }
}
