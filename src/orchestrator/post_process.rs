//! Post-run processing utilities.
//!
//! Stages a finished run's output, refreshes its display copy, and writes
//! downloads to disk for CLI layers.

use crate::display::{convert_and_resample, DisplayAdapter, DisplayHandle};
use crate::error::RunnerError;
use crate::model::FilterParameters;
use crate::native::ConversionBackend;
use crate::store::{Area, StagedFileStore};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Write `output` to `raw/<output_filename>` and produce a fresh display handle for it.
pub(crate) fn process_completion(
    store: &mut StagedFileStore,
    converter: &dyn ConversionBackend,
    display: &mut DisplayAdapter,
    parameters: &FilterParameters,
    output: Bytes,
) -> Result<DisplayHandle, RunnerError> {
    let name = parameters.output_filename();
    store.write(Area::Raw, &name, output)?;
    // Display copies of outputs are never reused across runs.
    store.remove(Area::Display, &name);
    convert_and_resample(converter, store, &name, &name)?;
    let shown = store.read(Area::Display, &name)?;
    Ok(display.to_displayable(shown, &name))
}

/// Save a downloaded output under `dir`, creating it if needed.
pub fn save_output(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
