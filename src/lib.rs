//! Job runner for coherence-enhancing anisotropic diffusion filters.
//!
//! A [`orchestrator::JobController`] stages inputs into a two-area
//! [`store::StagedFileStore`], executes the native filter through an
//! [`engine::ExecutionBackend`] (inline or on a worker thread), converts the
//! result for display and reports progress as [`model::JobEvent`]s.

pub mod cli;
pub mod display;
pub mod engine;
pub mod error;
pub mod model;
pub mod native;
pub mod orchestrator;
pub mod presets;
pub mod source;
pub mod store;
mod text_summary;
