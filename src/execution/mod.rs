//! Workflow Execution Module
//!
//! Runs step-graph instances: sequencing, retries with backoff, waits
//! on external signals, bounded parallel branches and subprocesses.
//! Every checkpoint goes through the store's compare-and-swap.
//!
//! # Architecture
//!
//! - [`engine`]: The instance runner and its lifecycle operations
//! - [`step`]: Execution of a single step by kind

pub mod engine;
pub mod step;

pub use engine::Engine;
pub use step::{execute_step, StepOutcome};
