//! Controller/worker message contract.
//!
//! On the wire every message is an [`Envelope`]: a JSON-serializable header plus
//! an optional byte payload moved alongside it. `Bytes` payloads are handed over
//! by reference count, never copied, but nothing here relies on that.
//!
//! Inside the crate the envelopes are decoded into the tagged [`WorkerRequest`]
//! and [`WorkerReply`] enums. A header without `cmd` that carries `output_data`
//! is the completion signal.

use crate::error::{Failure, RunnerError};
use crate::model::{FilterParameters, JobId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod cmd {
    pub const INSTALL_INPUT: &str = "install_input";
    pub const RUN_FILTER: &str = "run_filter";
    pub const EXECUTE: &str = "execute";
    pub const SET_PROGRESS: &str = "set_progress";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_filepath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<FilterParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Raw input image for `install_input`.
    #[serde(skip)]
    pub data: Option<Bytes>,
    /// Raw filter output; its presence without `cmd` marks completion.
    #[serde(skip)]
    pub output_data: Option<Bytes>,
}

impl Envelope {
    fn command(job_id: JobId, name: &str) -> Self {
        Self {
            job_id,
            cmd: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// JSON header as posted across the boundary (byte payloads excluded).
    pub fn header(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Controller → worker.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    InstallInput {
        job_id: JobId,
        input_filepath: String,
        data: Bytes,
    },
    RunFilter {
        job_id: JobId,
        parameters: FilterParameters,
    },
}

impl WorkerRequest {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerRequest::InstallInput { job_id, .. } | WorkerRequest::RunFilter { job_id, .. } => {
                *job_id
            }
        }
    }

    pub fn encode(self) -> Envelope {
        match self {
            WorkerRequest::InstallInput {
                job_id,
                input_filepath,
                data,
            } => Envelope {
                input_filepath: Some(input_filepath),
                data: Some(data),
                ..Envelope::command(job_id, cmd::INSTALL_INPUT)
            },
            WorkerRequest::RunFilter { job_id, parameters } => Envelope {
                parameters: Some(parameters),
                ..Envelope::command(job_id, cmd::RUN_FILTER)
            },
        }
    }

    pub fn decode(env: Envelope) -> Result<Self, RunnerError> {
        let job_id = env.job_id;
        match env.cmd.as_deref() {
            Some(cmd::INSTALL_INPUT) => Ok(WorkerRequest::InstallInput {
                job_id,
                input_filepath: env
                    .input_filepath
                    .ok_or_else(|| missing(cmd::INSTALL_INPUT, "input_filepath"))?,
                data: env.data.ok_or_else(|| missing(cmd::INSTALL_INPUT, "data"))?,
            }),
            Some(cmd::RUN_FILTER) => Ok(WorkerRequest::RunFilter {
                job_id,
                parameters: env
                    .parameters
                    .ok_or_else(|| missing(cmd::RUN_FILTER, "parameters"))?,
            }),
            Some(other) => Err(RunnerError::Protocol(format!(
                "unknown worker command {other:?} (job {job_id})"
            ))),
            None => Err(RunnerError::Protocol(format!(
                "request without cmd (job {job_id})"
            ))),
        }
    }
}

/// Worker → controller.
#[derive(Debug, Clone)]
pub enum WorkerReply {
    /// Input staged; the controller may now send `run_filter`.
    Execute { job_id: JobId },
    Progress { job_id: JobId, progress: u8 },
    Completed { job_id: JobId, output: Bytes },
    Failed { job_id: JobId, failure: Failure },
}

impl WorkerReply {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerReply::Execute { job_id }
            | WorkerReply::Progress { job_id, .. }
            | WorkerReply::Completed { job_id, .. }
            | WorkerReply::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn encode(self) -> Envelope {
        match self {
            WorkerReply::Execute { job_id } => Envelope::command(job_id, cmd::EXECUTE),
            WorkerReply::Progress { job_id, progress } => Envelope {
                progress: Some(progress),
                ..Envelope::command(job_id, cmd::SET_PROGRESS)
            },
            WorkerReply::Completed { job_id, output } => Envelope {
                job_id,
                output_data: Some(output),
                ..Default::default()
            },
            WorkerReply::Failed { job_id, failure } => Envelope {
                failure: Some(failure),
                ..Envelope::command(job_id, cmd::FAILED)
            },
        }
    }

    pub fn decode(env: Envelope) -> Result<Self, RunnerError> {
        let job_id = env.job_id;
        match env.cmd.as_deref() {
            Some(cmd::EXECUTE) => Ok(WorkerReply::Execute { job_id }),
            Some(cmd::SET_PROGRESS) => {
                let progress = env
                    .progress
                    .ok_or_else(|| missing(cmd::SET_PROGRESS, "progress"))?;
                Ok(WorkerReply::Progress {
                    job_id,
                    progress: progress.min(100),
                })
            }
            Some(cmd::FAILED) => Ok(WorkerReply::Failed {
                job_id,
                failure: env
                    .failure
                    .unwrap_or_else(|| Failure::protocol("worker failed without a reason")),
            }),
            Some(other) => Err(RunnerError::Protocol(format!(
                "unrecognized reply command {other:?} (job {job_id})"
            ))),
            None => match env.output_data {
                Some(output) => Ok(WorkerReply::Completed { job_id, output }),
                None => Err(RunnerError::Protocol(format!(
                    "reply without cmd or output_data (job {job_id})"
                ))),
            },
        }
    }
}

fn missing(cmd: &str, field: &str) -> RunnerError {
    RunnerError::Protocol(format!("{cmd} is missing `{field}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn completion_has_no_cmd_in_header() {
        let env = WorkerReply::Completed {
            job_id: 4,
            output: Bytes::from_static(b"png"),
        }
        .encode();
        let header = env.header();
        assert!(header.get("cmd").is_none());
        assert_eq!(header["job_id"], 4);
        assert_matches!(
            WorkerReply::decode(env),
            Ok(WorkerReply::Completed { job_id: 4, output }) if output == &b"png"[..]
        );
    }

    #[test]
    fn install_input_header_names_path_but_not_bytes() {
        let env = WorkerRequest::InstallInput {
            job_id: 1,
            input_filepath: "/raw/PacMan.png".into(),
            data: Bytes::from_static(b"\x89PNG"),
        }
        .encode();
        let header = env.header();
        assert_eq!(header["cmd"], cmd::INSTALL_INPUT);
        assert_eq!(header["input_filepath"], "/raw/PacMan.png");
        assert!(header.get("data").is_none());
        assert!(env.data.is_some());
    }

    #[test]
    fn run_filter_carries_parameters() {
        let params = FilterParameters::default();
        let env = WorkerRequest::RunFilter {
            job_id: 2,
            parameters: params.clone(),
        }
        .encode();
        assert_eq!(env.header()["parameters"]["diffusion_type"], "cEED");
        assert_matches!(
            WorkerRequest::decode(env),
            Ok(WorkerRequest::RunFilter { job_id: 2, parameters }) if parameters == params
        );
    }

    #[test]
    fn unknown_reply_command_is_protocol_error() {
        let env = Envelope {
            job_id: 9,
            cmd: Some("reticulate".into()),
            ..Default::default()
        };
        assert_matches!(WorkerReply::decode(env), Err(RunnerError::Protocol(_)));
    }

    #[test]
    fn bare_reply_without_output_is_protocol_error() {
        let env = Envelope {
            job_id: 3,
            ..Default::default()
        };
        assert_matches!(WorkerReply::decode(env), Err(RunnerError::Protocol(_)));
    }

    #[test]
    fn progress_is_clamped() {
        let env = Envelope {
            job_id: 1,
            cmd: Some(cmd::SET_PROGRESS.into()),
            progress: Some(140),
            ..Default::default()
        };
        assert_matches!(
            WorkerReply::decode(env),
            Ok(WorkerReply::Progress { progress: 100, .. })
        );
    }

    #[test]
    fn header_round_trips_through_json() {
        let env = WorkerReply::Progress {
            job_id: 5,
            progress: 30,
        }
        .encode();
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_matches!(
            WorkerReply::decode(back),
            Ok(WorkerReply::Progress {
                job_id: 5,
                progress: 30
            })
        );
    }
}
