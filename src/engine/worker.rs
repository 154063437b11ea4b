//! Worker strategy: the filter runs on a dedicated thread that owns its own
//! staged store and talks to the controller only through [`Envelope`]s.
//!
//! Per job the exchange is
//! `install_input → execute → run_filter → set_progress* → completion`.
//! `run_filter` is only sent after the matching `execute`, and never while an
//! earlier run is still outstanding.

use super::protocol::{Envelope, WorkerReply, WorkerRequest};
use super::{execute_filter, BackendEvent, BackendKind, ExecutionBackend, Submission};
use crate::error::{Failure, RunnerError};
use crate::model::JobId;
use crate::native::ComputeBackend;
use crate::store::{Area, StagedFileStore};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Controller-side view of the worker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    AwaitingInstallAck(JobId),
    Running(JobId),
}

pub struct WorkerBackend {
    request_tx: UnboundedSender<Envelope>,
    reply_rx: UnboundedReceiver<Envelope>,
    /// Install sent, `execute` not yet received.
    pending_install: Option<Submission>,
    /// Acknowledged but held back until the outstanding run finishes.
    deferred_run: Option<Submission>,
    outstanding_run: Option<JobId>,
    ready: VecDeque<BackendEvent>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerBackend {
    /// Start a worker thread running [`run_worker`].
    pub fn spawn(compute: Arc<dyn ComputeBackend>) -> Result<Self, RunnerError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel::<Envelope>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Envelope>();
        let thread = std::thread::Builder::new()
            .name("filter-worker".into())
            .spawn(move || run_worker(compute, request_rx, reply_tx))?;
        let mut backend = Self::with_channel(request_tx, reply_rx);
        backend._thread = Some(thread);
        Ok(backend)
    }

    /// Attach to an already running worker endpoint.
    pub fn with_channel(
        request_tx: UnboundedSender<Envelope>,
        reply_rx: UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            request_tx,
            reply_rx,
            pending_install: None,
            deferred_run: None,
            outstanding_run: None,
            ready: VecDeque::new(),
            _thread: None,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        if let Some(sub) = &self.pending_install {
            WorkerPhase::AwaitingInstallAck(sub.job_id)
        } else if let Some(job_id) = self.outstanding_run {
            WorkerPhase::Running(job_id)
        } else {
            WorkerPhase::Idle
        }
    }

    fn post(&self, request: WorkerRequest) -> Result<(), RunnerError> {
        let job_id = request.job_id();
        let env = request.encode();
        tracing::debug!(job_id, header = %env.header(), "posting to worker");
        self.request_tx
            .send(env)
            .map_err(|_| RunnerError::Protocol("worker channel closed".into()))
    }

    fn start_run(&mut self, submission: Submission) -> Result<(), RunnerError> {
        let job_id = submission.job_id;
        self.post(WorkerRequest::RunFilter {
            job_id,
            parameters: submission.parameters,
        })?;
        self.outstanding_run = Some(job_id);
        Ok(())
    }

    /// Clear the outstanding run and start a deferred one, if any.
    fn finish_run(&mut self, job_id: JobId) {
        if self.outstanding_run != Some(job_id) {
            return;
        }
        self.outstanding_run = None;
        if let Some(deferred) = self.deferred_run.take() {
            let deferred_id = deferred.job_id;
            if let Err(e) = self.start_run(deferred) {
                self.ready.push_back(BackendEvent::Failed {
                    job_id: deferred_id,
                    failure: Failure::from(e),
                });
            }
        }
    }

    /// Fold one reply into the state machine, queueing whatever the controller must see.
    fn handle_reply(&mut self, env: Envelope) {
        let job_id = env.job_id;
        let reply = match WorkerReply::decode(env) {
            Ok(reply) => reply,
            Err(e) => {
                // The channel stays usable; only this job fails and its run is over.
                tracing::error!(job_id, error = %e, "bad worker message");
                self.ready.push_back(BackendEvent::Failed {
                    job_id,
                    failure: Failure::from(e),
                });
                self.finish_run(job_id);
                return;
            }
        };

        match reply {
            WorkerReply::Execute { job_id } => {
                let submission = match self.pending_install.take() {
                    Some(sub) if sub.job_id == job_id => sub,
                    other => {
                        self.pending_install = other;
                        tracing::debug!(job_id, "ignoring execute for a superseded install");
                        return;
                    }
                };
                if self.outstanding_run.is_some() {
                    tracing::debug!(job_id, "run deferred until the previous run completes");
                    self.deferred_run = Some(submission);
                    return;
                }
                if let Err(e) = self.start_run(submission) {
                    self.ready.push_back(BackendEvent::Failed {
                        job_id,
                        failure: Failure::from(e),
                    });
                }
            }
            WorkerReply::Progress { job_id, progress } => {
                self.ready
                    .push_back(BackendEvent::Progress { job_id, progress });
            }
            WorkerReply::Completed { job_id, output } => {
                self.ready
                    .push_back(BackendEvent::Completed { job_id, output });
                self.finish_run(job_id);
            }
            WorkerReply::Failed { job_id, failure } => {
                self.ready.push_back(BackendEvent::Failed { job_id, failure });
                self.finish_run(job_id);
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for WorkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Worker
    }

    fn submit(
        &mut self,
        submission: Submission,
        store: &mut StagedFileStore,
    ) -> Result<(), RunnerError> {
        let input_filepath = submission.parameters.input_path();
        let data = store.read(Area::Raw, &submission.parameters.input_filename)?;
        if let Some(previous) = self.pending_install.as_ref() {
            tracing::info!(
                superseded = previous.job_id,
                job_id = submission.job_id,
                "replacing pending install"
            );
        }
        // A run already acknowledged but not yet started is superseded as well.
        self.deferred_run = None;
        self.post(WorkerRequest::InstallInput {
            job_id: submission.job_id,
            input_filepath,
            data,
        })?;
        self.pending_install = Some(submission);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            let env = self.reply_rx.recv().await?;
            self.handle_reply(env);
        }
    }
}

/// Worker loop. Owns its own staged store; exits when the controller hangs up.
pub fn run_worker(
    compute: Arc<dyn ComputeBackend>,
    mut request_rx: UnboundedReceiver<Envelope>,
    reply_tx: UnboundedSender<Envelope>,
) {
    let mut store = StagedFileStore::new();
    store.ensure_directories();
    let reply = |r: WorkerReply| {
        let _ = reply_tx.send(r.encode());
    };

    while let Some(env) = request_rx.blocking_recv() {
        let job_id = env.job_id;
        let request = match WorkerRequest::decode(env) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(job_id, error = %e, "unknown worker command");
                reply(WorkerReply::Failed {
                    job_id,
                    failure: Failure::from(e),
                });
                continue;
            }
        };

        match request {
            WorkerRequest::InstallInput {
                job_id,
                input_filepath,
                data,
            } => {
                if let Err(e) = store.write_path(&input_filepath, data) {
                    // The run that follows reports the missing input.
                    tracing::error!(job_id, error = %e, "failed to stage input in worker");
                }
                reply(WorkerReply::Execute { job_id });
            }
            WorkerRequest::RunFilter { job_id, parameters } => {
                let mut last = None;
                let mut progress = |p: u8| {
                    if last != Some(p) {
                        last = Some(p);
                        reply(WorkerReply::Progress {
                            job_id,
                            progress: p,
                        });
                    }
                };
                match execute_filter(compute.as_ref(), &mut store, &parameters, &mut progress) {
                    Ok(output) => reply(WorkerReply::Completed { job_id, output }),
                    Err(e) => {
                        tracing::error!(job_id, error = %e, "worker run failed");
                        reply(WorkerReply::Failed {
                            job_id,
                            failure: Failure::from(e),
                        });
                    }
                }
            }
        }
    }
    tracing::debug!("filter worker exiting");
}
