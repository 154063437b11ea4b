//! Execution backends.
//!
//! One contract, two strategies: [`inline::InlineBackend`] runs the compute
//! backend on the caller's thread, [`worker::WorkerBackend`] hands the job to a
//! dedicated worker thread over the message protocol in [`protocol`]. The
//! strategy is chosen once, at startup.

pub mod inline;
pub mod protocol;
pub mod worker;

use crate::error::{Failure, RunnerError};
use crate::model::{FilterParameters, JobId};
use crate::native::ComputeBackend;
use crate::store::StagedFileStore;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Inline,
    Worker,
}

impl BackendKind {
    /// Honor an explicit preference, otherwise use a worker whenever the host
    /// can run one alongside the controller.
    pub fn detect(preference: Option<BackendKind>) -> Self {
        if let Some(kind) = preference {
            return kind;
        }
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if threads > 1 {
            BackendKind::Worker
        } else {
            BackendKind::Inline
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Inline => write!(f, "inline"),
            BackendKind::Worker => write!(f, "worker"),
        }
    }
}

/// A job as handed to a backend: an id plus the parameter snapshot.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: JobId,
    pub parameters: FilterParameters,
}

#[derive(Debug, Clone)]
pub enum BackendEvent {
    Progress { job_id: JobId, progress: u8 },
    Completed { job_id: JobId, output: Bytes },
    Failed { job_id: JobId, failure: Failure },
}

impl BackendEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            BackendEvent::Progress { job_id, .. }
            | BackendEvent::Completed { job_id, .. }
            | BackendEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

#[async_trait]
pub trait ExecutionBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Start `submission`. The input must already be staged in `store`.
    ///
    /// Errors returned here are synchronous submission failures; everything
    /// after that arrives through [`ExecutionBackend::next_event`].
    fn submit(
        &mut self,
        submission: Submission,
        store: &mut StagedFileStore,
    ) -> Result<(), RunnerError>;

    /// Next progress or completion event. Cancel-safe; `None` once the backend
    /// can no longer produce events.
    async fn next_event(&mut self) -> Option<BackendEvent>;
}

/// Run the compute backend against `store` and return the staged output bytes.
pub(crate) fn execute_filter(
    compute: &dyn ComputeBackend,
    store: &mut StagedFileStore,
    parameters: &FilterParameters,
    progress: &mut dyn FnMut(u8),
) -> Result<Bytes, RunnerError> {
    let input_path = parameters.input_path();
    let output_path = parameters.output_path();
    if store.read_path(&input_path).is_err() {
        return Err(RunnerError::NotFound { path: input_path });
    }
    // A previous run's output must never be mistaken for this one's.
    if let Ok((area, name)) = crate::store::parse_path(&output_path) {
        store.remove(area, name);
    }

    let args = parameters.to_argument_list();
    tracing::debug!(?args, "calling compute backend");
    let status = compute.call_main(store, &args, progress);
    if status != 0 {
        return Err(RunnerError::Backend {
            stage: crate::error::BackendStage::Compute,
            status,
        });
    }
    store.read_path(&output_path)
}

/// Build the strategy for `kind`, falling back to inline when a worker cannot be started.
pub fn create_backend(
    kind: BackendKind,
    compute: Arc<dyn ComputeBackend>,
) -> Box<dyn ExecutionBackend> {
    match kind {
        BackendKind::Inline => Box::new(inline::InlineBackend::new(compute)),
        BackendKind::Worker => match worker::WorkerBackend::spawn(compute.clone()) {
            Ok(backend) => Box::new(backend),
            Err(e) => {
                tracing::warn!(error = %e, "worker unavailable, running inline");
                Box::new(inline::InlineBackend::new(compute))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_preference_wins() {
        assert_eq!(
            BackendKind::detect(Some(BackendKind::Inline)),
            BackendKind::Inline
        );
        assert_eq!(
            BackendKind::detect(Some(BackendKind::Worker)),
            BackendKind::Worker
        );
    }
}
