#![doc = include_str!("../README.md")]
// No warnings
//#![deny(warnings)]
// for now we don't need any new feature but we might remove this in the future
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_pub)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
// the code must be documented and everything should have a debug print implementation
#![deny(unused_doc_comments)]

//! Core pipeline for finding duplicate and near-duplicate images across one
//! or two directory trees (SPEC_FULL.md §1-§2).
//!
//! The crate is organized the way the pipeline's data flows:
//! filesystem -> [`catalog`] -> [`pipeline::indexer`] ->
//! [`pipeline::first_loop`] (using [`image_ops`] and [`workers::preprocess`])
//! -> [`planner`] -> [`pipeline::second_loop`] (using [`cache`] and
//! [`workers::compare`]), all driven end to end by [`pipeline::Driver`].
//! [`config`], [`error`], and [`types`] are the shared vocabulary every
//! stage speaks; [`util`] holds the small pure helpers none of them own
//! exclusively.
//!
//! This crate is the resumable pipeline core only: no command-line surface,
//! no GPU kernel, no plotting of matched pairs (SPEC_FULL.md §1 non-goals).
//! [`pipeline::Driver`] is the entry point a CLI or other front end wraps.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod image_ops;
pub mod pipeline;
pub mod planner;
pub mod types;
pub mod util;
pub mod workers;

/// Prelude module to import everything this crate's consumers typically
/// need at once: the driver, its configuration, and its error type.
pub mod prelude {
    pub use crate::catalog::{Catalog, Cluster, DuplicatePair};
    pub use crate::config::{Config, FirstLoopOptions, Partition, Progress, SecondLoopOptions};
    pub use crate::error::{PipelineError, Result};
    pub use crate::pipeline::Driver;
}
