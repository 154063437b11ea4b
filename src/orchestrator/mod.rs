//! Application-level orchestration.
//!
//! This module owns the job lifecycle (submit, supersede, complete, fail) and
//! post-run processing of outputs. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;

pub use controller::{run_controller, ControllerParts, JobController, UiCommand};
pub use post_process::save_output;
