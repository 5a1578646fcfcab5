//! Splitrun Core
//!
//! Core types and abstractions for the splitrun test-partition orchestrator.
//!
//! This crate contains:
//! - Domain types: split descriptors, resource budgets, job categories,
//!   worker identities and the aggregated run result
//! - Selection: slicing of an ordered, line-delimited test list
//! - Errors: the preflight and launch error taxonomy

pub mod domain;
pub mod error;
pub mod selection;

pub use error::{Error, Result};
