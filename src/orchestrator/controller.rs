//! Job lifecycle controller.
//!
//! Owns the parameter model, the staged store and the execution backend,
//! sequences "stage input → execute → convert output → notify", and emits
//! [`JobEvent`]s for presentation layers. A new submission replaces the current
//! job; events that arrive for a replaced job are dropped.

use super::post_process::process_completion;
use crate::display::{convert_and_resample, DisplayAdapter, DisplayHandle, HostCapabilities};
use crate::engine::{BackendEvent, BackendKind, ExecutionBackend, Submission};
use crate::error::{Failure, RunnerError};
use crate::model::{
    canonical_number, FilterParameters, Job, JobEvent, JobId, JobState, ParameterField,
    ParameterUpdate,
};
use crate::native::ConversionBackend;
use crate::presets;
use crate::source::{ImageSource, InputSource};
use crate::store::{Area, StagedFileStore};
use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub enum UiCommand {
    Set(ParameterUpdate),
    /// Raw control value, parsed by the parameter model.
    SetField { field: String, value: String },
    /// Submit with the current parameters; `None` reuses the current input.
    Submit(Option<InputSource>),
    ApplyPreset { scenario: u32, variant: u32 },
    /// Report the current parameters as an `Info` event.
    Show,
    Quit,
}

/// External collaborators the controller drives.
pub struct ControllerParts {
    pub backend: Box<dyn ExecutionBackend>,
    pub converter: Arc<dyn ConversionBackend>,
    pub images: Arc<dyn ImageSource>,
    pub host: HostCapabilities,
}

pub struct JobController {
    parameters: FilterParameters,
    store: StagedFileStore,
    backend: Box<dyn ExecutionBackend>,
    backend_alive: bool,
    converter: Arc<dyn ConversionBackend>,
    images: Arc<dyn ImageSource>,
    display: DisplayAdapter,
    job: Job,
    next_job_id: JobId,
    input_handle: Option<(String, DisplayHandle)>,
    output_handle: Option<DisplayHandle>,
    event_tx: UnboundedSender<JobEvent>,
}

impl JobController {
    pub fn new(
        parts: ControllerParts,
        parameters: FilterParameters,
        event_tx: UnboundedSender<JobEvent>,
    ) -> Result<Self, RunnerError> {
        parameters.validate()?;
        let mut store = StagedFileStore::new();
        store.ensure_directories();
        let job = Job::new(0, parameters.clone());
        Ok(Self {
            parameters,
            store,
            backend: parts.backend,
            backend_alive: true,
            converter: parts.converter,
            images: parts.images,
            display: DisplayAdapter::new(parts.host),
            job,
            next_job_id: 0,
            input_handle: None,
            output_handle: None,
            event_tx,
        })
    }

    /// Parameters the next submission will snapshot.
    pub fn parameters(&self) -> &FilterParameters {
        &self.parameters
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn store(&self) -> &StagedFileStore {
        &self.store
    }

    pub fn display(&self) -> &DisplayAdapter {
        &self.display
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_busy(&self) -> bool {
        self.job.state.is_in_flight()
    }

    pub fn set_parameter(&mut self, update: ParameterUpdate) -> Result<(), RunnerError> {
        self.parameters.set(update)
    }

    pub fn set_parameter_str(&mut self, field: &str, value: &str) -> Result<(), RunnerError> {
        let field: ParameterField = field.parse()?;
        self.parameters.set_str(field, value)
    }

    /// Replace every field at once; nothing changes if `parameters` is invalid.
    pub fn replace_parameters(&mut self, parameters: FilterParameters) -> Result<(), RunnerError> {
        parameters.validate()?;
        self.parameters = parameters;
        Ok(())
    }

    /// Look up a preset, install all of its parameters, and submit its input.
    pub async fn apply_preset(&mut self, scenario: u32, variant: u32) -> Result<JobId, RunnerError> {
        let preset = presets::lookup(scenario, variant)?;
        tracing::info!(
            scenario = preset.scenario_name,
            variant = preset.variant_name,
            "applying preset"
        );
        self.replace_parameters(preset.parameters())?;
        self.emit(JobEvent::Info(format!(
            "preset {}: {} / {}",
            scenario, preset.scenario_name, preset.variant_name
        )));
        self.submit(Some(InputSource::Named(preset.input_filename.to_string())))
            .await
    }

    /// Start a job with a snapshot of the current parameters.
    ///
    /// Only configuration problems are returned; anything that goes wrong after
    /// the job exists is reported through [`JobEvent::Failed`].
    pub async fn submit(&mut self, source: Option<InputSource>) -> Result<JobId, RunnerError> {
        let mut snapshot = self.parameters.clone();
        if let Some(src) = source.as_ref() {
            snapshot.input_filename = src.name().to_string();
        }
        snapshot.validate()?;
        self.parameters.input_filename = snapshot.input_filename.clone();

        self.next_job_id += 1;
        let job_id = self.next_job_id;
        if self.job.state.is_in_flight() {
            tracing::info!(superseded = self.job.id, job_id, "replacing in-flight job");
        }
        self.job = Job::new(job_id, snapshot.clone());
        self.set_state(JobState::Staging);

        if let Err(e) = self.stage_input(source).await {
            self.fail(job_id, Failure::from(e));
            return Ok(job_id);
        }
        self.show_input(&snapshot.input_filename);

        self.set_state(JobState::Running);
        let submission = Submission {
            job_id,
            parameters: snapshot,
        };
        if let Err(e) = self.backend.submit(submission, &mut self.store) {
            self.fail(job_id, Failure::from(e));
        }
        Ok(job_id)
    }

    /// Next event from the execution backend; pends forever once it is gone.
    pub async fn next_backend_event(&mut self) -> Option<BackendEvent> {
        if !self.backend_alive {
            return futures::future::pending().await;
        }
        let event = self.backend.next_event().await;
        if event.is_none() {
            self.backend_alive = false;
        }
        event
    }

    pub fn handle_backend_event(&mut self, event: BackendEvent) {
        let job_id = event.job_id();
        if job_id != self.job.id || self.job.state != JobState::Running {
            tracing::warn!(
                job_id,
                current = self.job.id,
                state = ?self.job.state,
                "discarding event for a job that is no longer running"
            );
            return;
        }
        match event {
            BackendEvent::Progress { progress, .. } => {
                self.job.progress = progress;
                self.emit(JobEvent::ProgressChanged { job_id, progress });
            }
            BackendEvent::Completed { output, .. } => self.complete(output),
            BackendEvent::Failed { failure, .. } => self.fail(job_id, failure),
        }
    }

    /// The backend stopped producing events; fail whatever was waiting on it.
    pub fn backend_lost(&mut self) {
        tracing::error!(backend = %self.backend.kind(), "execution backend stopped");
        if self.job.state == JobState::Running {
            self.fail(
                self.job.id,
                Failure::from(RunnerError::Protocol("execution backend stopped".into())),
            );
        }
    }

    /// One-line rendering of the current parameters in native argument order.
    pub fn describe(&self) -> String {
        let p = &self.parameters;
        format!(
            "input={} output={} time={} lambda={} type={} noise={} feature={} exponent={}",
            p.input_filename,
            p.output_filename(),
            canonical_number(p.diffusion_time),
            canonical_number(p.lambda),
            p.diffusion_type,
            canonical_number(p.noise_scale),
            canonical_number(p.feature_scale),
            canonical_number(p.exponent),
        )
    }

    /// Report a command that was refused before any job was created.
    pub fn reject(&self, err: RunnerError) {
        tracing::warn!(error = %err, "command rejected");
        self.emit(JobEvent::Rejected {
            reason: Failure::from(err),
        });
    }

    async fn stage_input(&mut self, source: Option<InputSource>) -> Result<(), RunnerError> {
        let name = self.job.parameters.input_filename.clone();
        match source {
            Some(InputSource::Supplied { data, .. }) => {
                self.store.write(Area::Raw, &name, data)?;
                self.store.remove(Area::Display, &name);
            }
            Some(InputSource::Named(_)) | None => {
                if self.store.has(Area::Raw, &name) {
                    tracing::debug!(input = %name, "input already staged");
                } else {
                    let images = self.images.clone();
                    let data = images.fetch(&name).await?;
                    tracing::info!(input = %name, bytes = data.len(), "installing input");
                    self.store.write(Area::Raw, &name, data)?;
                    self.store.remove(Area::Display, &name);
                }
            }
        }
        Ok(())
    }

    /// Emit `InputReady` for a newly staged input. Conversion failures only cost the preview.
    fn show_input(&mut self, name: &str) {
        let already_shown = self
            .input_handle
            .as_ref()
            .is_some_and(|(shown, _)| shown == name);
        if already_shown && self.store.has(Area::Display, name) {
            return;
        }
        if !self.store.has(Area::Display, name) {
            if let Err(e) = convert_and_resample(self.converter.as_ref(), &mut self.store, name, name)
            {
                tracing::warn!(input = %name, error = %e, "input preview unavailable");
                return;
            }
        }
        let shown = match self.store.read(Area::Display, name) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(input = %name, error = %e, "input preview unavailable");
                return;
            }
        };
        let handle = self.display.to_displayable(shown, name);
        if let Some((_, previous)) = self.input_handle.replace((name.to_string(), handle.clone())) {
            self.display.revoke(&previous);
        }
        self.emit(JobEvent::InputReady {
            name: name.to_string(),
            handle,
        });
    }

    fn complete(&mut self, output: Bytes) {
        let job_id = self.job.id;
        self.set_state(JobState::Converting);
        let processed = process_completion(
            &mut self.store,
            self.converter.as_ref(),
            &mut self.display,
            &self.job.parameters,
            output.clone(),
        );
        let handle = match processed {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(job_id, Failure::from(e));
                return;
            }
        };
        if let Some(previous) = self.output_handle.replace(handle.clone()) {
            self.display.revoke(&previous);
        }
        self.job.output_bytes = Some(output.clone());
        self.job.progress = 0;
        self.emit(JobEvent::ProgressChanged {
            job_id,
            progress: 0,
        });
        self.set_state(JobState::Done);
        self.emit(JobEvent::OutputReady {
            job_id,
            handle,
            download_name: self.job.parameters.output_filename(),
            output: Box::new(output),
        });
    }

    fn fail(&mut self, job_id: JobId, failure: Failure) {
        if job_id != self.job.id {
            return;
        }
        tracing::error!(job_id, kind = ?failure.kind, reason = %failure, "job failed");
        self.job.failure = Some(failure.clone());
        self.set_state(JobState::Failed);
        self.emit(JobEvent::Failed {
            job_id,
            reason: failure,
        });
    }

    fn set_state(&mut self, state: JobState) {
        self.job.state = state;
        tracing::info!(job_id = self.job.id, ?state, "job state");
        self.emit(JobEvent::StateChanged {
            job_id: self.job.id,
            state,
        });
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Drive `controller` from UI commands and backend events until quit.
///
/// Quit waits for the running job to settle so presentation layers see its outcome.
pub async fn run_controller(
    controller: &mut JobController,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut quit_pending = false;

    loop {
        if quit_pending && !controller.is_busy() {
            break;
        }
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::Set(update)) => {
                        if let Err(e) = controller.set_parameter(update) {
                            controller.reject(e);
                        }
                    }
                    Some(UiCommand::SetField { field, value }) => {
                        if let Err(e) = controller.set_parameter_str(&field, &value) {
                            controller.reject(e);
                        }
                    }
                    Some(UiCommand::Submit(source)) => {
                        if let Err(e) = controller.submit(source).await {
                            controller.reject(e);
                        }
                    }
                    Some(UiCommand::ApplyPreset { scenario, variant }) => {
                        if let Err(e) = controller.apply_preset(scenario, variant).await {
                            controller.reject(e);
                        }
                    }
                    Some(UiCommand::Show) => {
                        controller.emit(JobEvent::Info(controller.describe()));
                    }
                    Some(UiCommand::Quit) | None => {
                        quit_pending = true;
                    }
                }
            }
            event = controller.next_backend_event() => {
                match event {
                    Some(event) => controller.handle_backend_event(event),
                    None => controller.backend_lost(),
                }
            }
        }
    }

    Ok(())
}
