//! Service layer
//!
//! Services contain the logic of a partitioned run: sizing the worker pool,
//! planning splits, acquiring the image, launching workers, streaming their
//! logs and aggregating what they report.
//!
//! Engine-facing services sit behind traits so they can be tested without
//! a container engine.

pub mod aggregator;
pub mod diagnostics;
pub mod estimator;
pub mod image;
pub mod launcher;
pub mod log_stream;
pub mod planner;

// Re-export traits
pub use image::ImageSource;

// Re-export implementations
pub use aggregator::CompletionAggregator;
pub use estimator::{ResourceEstimator, detect_budget};
pub use image::{PodmanImageSource, acquire_image};
pub use launcher::{LaunchSettings, WorkerLauncher};
pub use log_stream::LogStreamer;
pub use planner::SplitPlanner;
