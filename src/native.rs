//! Seams for the native collaborators: the diffusion filter itself and the
//! decode/resample routine that prepares display copies.
//!
//! Both are driven like command-line programs: string arguments naming staged
//! paths in, integer status out, side effects in the [`StagedFileStore`].

use crate::error::RunnerError;
use crate::store::{parse_path, StagedFileStore};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Status reported when a native program could not be launched or its files
/// could not be moved in or out of the staged store.
pub const LAUNCH_FAILURE_STATUS: i32 = -1;

pub trait ComputeBackend: Send + Sync {
    /// Run the filter with positional arguments
    /// `[input_path, output_path, diffusion_time, lambda, diffusion_type, noise_scale, feature_scale, exponent]`.
    ///
    /// Writes `output_path` on success. `progress` may be called with values in 0..=100.
    fn call_main(
        &self,
        store: &mut StagedFileStore,
        args: &[String],
        progress: &mut dyn FnMut(u8),
    ) -> i32;
}

pub trait ConversionBackend: Send + Sync {
    fn convert_and_resample(
        &self,
        store: &mut StagedFileStore,
        raw_path: &str,
        display_path: &str,
    ) -> i32;
}

/// Pull a percentage out of the filter's `"<Class> has completed: N%"` lines.
pub fn parse_progress_line(line: &str) -> Option<u8> {
    let (_, rest) = line.split_once("has completed:")?;
    let value: u32 = rest.trim().strip_suffix('%')?.trim().parse().ok()?;
    Some(value.min(100) as u8)
}

/// Temporary on-disk mirror of the staged areas for an external program.
struct Scratch {
    dir: tempfile::TempDir,
}

impl Scratch {
    fn new() -> Result<Self, RunnerError> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    fn host_path(&self, staged: &str) -> Result<PathBuf, RunnerError> {
        let (area, name) = parse_path(staged)?;
        let area_dir = self.dir.path().join(area.to_string());
        std::fs::create_dir_all(&area_dir)?;
        Ok(area_dir.join(name))
    }

    fn stage_in(&self, store: &StagedFileStore, staged: &str) -> Result<PathBuf, RunnerError> {
        let bytes = store.read_path(staged)?;
        let path = self.host_path(staged)?;
        std::fs::write(&path, &bytes)?;
        Ok(path)
    }

    fn stage_out(
        &self,
        store: &mut StagedFileStore,
        host: &Path,
        staged: &str,
    ) -> Result<(), RunnerError> {
        let bytes = std::fs::read(host).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::NotFound {
                    path: staged.to_string(),
                }
            } else {
                RunnerError::Io(e)
            }
        })?;
        store.write_path(staged, bytes)
    }

    /// Like [`Scratch::stage_out`], but a program that exited cleanly without
    /// writing its output leaves the staged path absent instead of failing.
    fn stage_out_if_written(
        &self,
        store: &mut StagedFileStore,
        host: &Path,
        staged: &str,
    ) -> Result<(), RunnerError> {
        match self.stage_out(store, host, staged) {
            Err(RunnerError::NotFound { path }) => {
                tracing::warn!(%path, "program exited 0 without writing its output");
                Ok(())
            }
            other => other,
        }
    }
}

/// Runs the filter as an external executable (for example the
/// `CoherenceEnhancingDiffusion` command-line tool).
#[derive(Debug, Clone)]
pub struct ProcessComputeBackend {
    program: PathBuf,
}

impl ProcessComputeBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(
        &self,
        store: &mut StagedFileStore,
        args: &[String],
        progress: &mut dyn FnMut(u8),
    ) -> Result<i32, RunnerError> {
        let [input, output, rest @ ..] = args else {
            return Err(RunnerError::config(
                "arguments",
                "expected at least an input and an output path",
            ));
        };
        let scratch = Scratch::new()?;
        let input_host = scratch.stage_in(store, input)?;
        let output_host = scratch.host_path(output)?;

        let mut child = Command::new(&self.program)
            .arg(&input_host)
            .arg(&output_host)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                match parse_progress_line(&line) {
                    Some(p) => progress(p),
                    None => tracing::debug!(program = %self.program.display(), "{line}"),
                }
            }
        }

        let status = child.wait()?;
        let code = status.code().unwrap_or(LAUNCH_FAILURE_STATUS);
        if code == 0 {
            scratch.stage_out_if_written(store, &output_host, output)?;
        }
        Ok(code)
    }
}

impl ComputeBackend for ProcessComputeBackend {
    fn call_main(
        &self,
        store: &mut StagedFileStore,
        args: &[String],
        progress: &mut dyn FnMut(u8),
    ) -> i32 {
        self.run(store, args, progress).unwrap_or_else(|e| {
            tracing::error!(program = %self.program.display(), error = %e, "filter process failed");
            LAUNCH_FAILURE_STATUS
        })
    }
}

/// Runs an external `ConvertAndResample`-style executable: `program <raw> <display>`.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
    program: PathBuf,
}

impl ProcessConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(
        &self,
        store: &mut StagedFileStore,
        raw_path: &str,
        display_path: &str,
    ) -> Result<i32, RunnerError> {
        let scratch = Scratch::new()?;
        let raw_host = scratch.stage_in(store, raw_path)?;
        let display_host = scratch.host_path(display_path)?;
        let status = Command::new(&self.program)
            .arg(&raw_host)
            .arg(&display_host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()?;
        let code = status.code().unwrap_or(LAUNCH_FAILURE_STATUS);
        if code == 0 {
            scratch.stage_out_if_written(store, &display_host, display_path)?;
        }
        Ok(code)
    }
}

impl ConversionBackend for ProcessConverter {
    fn convert_and_resample(
        &self,
        store: &mut StagedFileStore,
        raw_path: &str,
        display_path: &str,
    ) -> i32 {
        self.run(store, raw_path, display_path).unwrap_or_else(|e| {
            tracing::error!(program = %self.program.display(), error = %e, "conversion process failed");
            LAUNCH_FAILURE_STATUS
        })
    }
}

/// Copies raw bytes unchanged into the display area. Used when no native
/// converter is configured and the raw format is already displayable.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughConverter;

impl ConversionBackend for PassthroughConverter {
    fn convert_and_resample(
        &self,
        store: &mut StagedFileStore,
        raw_path: &str,
        display_path: &str,
    ) -> i32 {
        let copied = store
            .read_path(raw_path)
            .and_then(|bytes| store.write_path(display_path, bytes));
        match copied {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(error = %e, raw_path, "passthrough conversion failed");
                1
            }
        }
    }
}
