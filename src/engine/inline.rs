use super::{execute_filter, BackendEvent, BackendKind, ExecutionBackend, Submission};
use crate::error::{Failure, RunnerError};
use crate::native::ComputeBackend;
use crate::store::StagedFileStore;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;

/// Runs the filter synchronously inside `submit`.
///
/// The call cannot be preempted, so the only progress reported is the final
/// 100 that precedes the completion event.
pub struct InlineBackend {
    compute: Arc<dyn ComputeBackend>,
    ready: VecDeque<BackendEvent>,
}

impl InlineBackend {
    pub fn new(compute: Arc<dyn ComputeBackend>) -> Self {
        Self {
            compute,
            ready: VecDeque::new(),
        }
    }
}

#[async_trait]
impl ExecutionBackend for InlineBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Inline
    }

    fn submit(
        &mut self,
        submission: Submission,
        store: &mut StagedFileStore,
    ) -> Result<(), RunnerError> {
        let Submission { job_id, parameters } = submission;
        tracing::info!(job_id, input = %parameters.input_filename, "running filter inline");

        // Intermediate progress is meaningless here; the caller is blocked anyway.
        let result = execute_filter(self.compute.as_ref(), store, &parameters, &mut |_| {});
        match result {
            Ok(output) => {
                self.ready.push_back(BackendEvent::Progress {
                    job_id,
                    progress: 100,
                });
                self.ready
                    .push_back(BackendEvent::Completed { job_id, output });
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "inline run failed");
                self.ready.push_back(BackendEvent::Failed {
                    job_id,
                    failure: Failure::from(e),
                });
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        match self.ready.pop_front() {
            Some(event) => Some(event),
            None => futures::future::pending().await,
        }
    }
}
