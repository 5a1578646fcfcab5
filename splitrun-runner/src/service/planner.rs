//! Split planning
//!
//! Refines the caller's coarse `K/N` split into one finer split per worker.
//! The outer chunk is the caller's choice, the inner fan-out comes from the
//! host, so the same outer split runs on machines of any size.

use splitrun_core::domain::SplitSpec;
use splitrun_core::{Error, Result};

pub struct SplitPlanner;

impl SplitPlanner {
    /// Inner splits for `worker_count` workers covering `outer`
    ///
    /// Returns indices `(K-1)*w + 1 ..= K*w` of `N*w`. With one worker the
    /// outer split is returned untouched.
    pub fn plan(outer: SplitSpec, worker_count: usize) -> Result<Vec<SplitSpec>> {
        if worker_count == 0 {
            return Err(Error::InvalidWorkerCount(worker_count));
        }
        if worker_count == 1 {
            return Ok(vec![outer]);
        }

        let inner_total = outer.total() * worker_count;
        let first = (outer.index() - 1) * worker_count + 1;

        (first..first + worker_count)
            .map(|index| SplitSpec::new(index, inner_total))
            .collect()
    }
}
