//! Scheduler layer
//!
//! Owns the lifecycle of one run: the orchestrator drives the services in
//! order, and the teardown guard makes sure nothing it started outlives it.

pub mod orchestrator;
pub mod teardown;

pub use orchestrator::Orchestrator;
pub use teardown::TeardownGuard;
