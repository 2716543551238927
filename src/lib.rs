//! # maxillo-seg
//!
//! Patch-based training and evaluation of 3D segmentation networks for jaw
//! CT volumes, built on the Burn ML framework.
//!
//! ## Modules
//!
//! - [`volume`]: Subjects, split manifest, preprocessing and the volume store
//! - [`patch`]: Grid and label-biased samplers, aggregation, prefetch queue
//! - [`weights`]: Median frequency class balancing
//! - [`loss`]: Dice, weighted cross-entropy and BCE terms
//! - [`model`]: Model registry and 3D U-Net
//! - [`training`]: Optimizer, schedules, rank group, evaluator, orchestrator
//! - [`checkpoint`]: `best` / `last` checkpoint slots
//! - [`config`]: TOML configuration loading and validation
//! - [`logging`]: Per-run tracing subscriber
//! - [`error`]: Structured error types

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod loss;
pub mod model;
pub mod patch;
pub mod training;
pub mod volume;
pub mod weights;
