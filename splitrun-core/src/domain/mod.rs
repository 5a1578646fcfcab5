//! Core domain types
//!
//! These types describe a partitioned test run: how the host budget is
//! measured, which job category is being run, how the selection is split,
//! and what each worker reported back.

pub mod budget;
pub mod category;
pub mod result;
pub mod split;
pub mod worker;

pub use budget::ResourceBudget;
pub use category::JobCategory;
pub use result::{RunResult, WorkerOutcome};
pub use split::SplitSpec;
pub use worker::{WorkerIdentity, WorkerStatus};
