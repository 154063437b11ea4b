//! Staged virtual filesystem with a `raw` and a `display` area.
//!
//! Paths follow the `/raw/<name>` and `/display/<name>` convention so the
//! compute and conversion collaborators can be driven with plain string
//! arguments. The store is process-local and unsynchronized; the controller's
//! single-job policy keeps writers from overlapping.

use crate::error::RunnerError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    /// Full-fidelity inputs and compute outputs.
    Raw,
    /// Resampled renditions for on-screen display.
    Display,
}

impl Area {
    pub const ALL: [Area; 2] = [Area::Raw, Area::Display];

    pub fn dir(self) -> &'static str {
        match self {
            Area::Raw => "/raw",
            Area::Display => "/display",
        }
    }

    pub fn path(self, name: &str) -> String {
        format!("{}/{}", self.dir(), name)
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir()[1..])
    }
}

/// Split a staged path into its area and file name.
pub fn parse_path(path: &str) -> Result<(Area, &str), RunnerError> {
    for area in Area::ALL {
        if let Some(name) = path
            .strip_prefix(area.dir())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            if !name.is_empty() && !name.contains('/') {
                return Ok((area, name));
            }
        }
    }
    Err(RunnerError::NotFound {
        path: path.to_string(),
    })
}

#[derive(Debug, Default)]
pub struct StagedFileStore {
    // BTreeMap keeps listings stable for logs and tests.
    dirs: HashMap<Area, BTreeMap<String, Bytes>>,
}

impl StagedFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create both areas. Calling it again leaves existing contents alone.
    pub fn ensure_directories(&mut self) {
        for area in Area::ALL {
            self.dirs.entry(area).or_default();
        }
    }

    pub fn has_directory(&self, area: Area) -> bool {
        self.dirs.contains_key(&area)
    }

    /// Replace `name` in one step; readers never see a partial file.
    pub fn write(
        &mut self,
        area: Area,
        name: &str,
        bytes: impl Into<Bytes>,
    ) -> Result<(), RunnerError> {
        if name.is_empty() || name.contains('/') {
            return Err(RunnerError::config(
                "file name",
                format!("{name:?} is not a plain file name"),
            ));
        }
        let dir = self.dirs.get_mut(&area).ok_or_else(|| RunnerError::NotFound {
            path: area.dir().to_string(),
        })?;
        dir.insert(name.to_string(), bytes.into());
        Ok(())
    }

    pub fn read(&self, area: Area, name: &str) -> Result<Bytes, RunnerError> {
        self.dirs
            .get(&area)
            .and_then(|dir| dir.get(name))
            .cloned()
            .ok_or_else(|| RunnerError::NotFound {
                path: area.path(name),
            })
    }

    pub fn has(&self, area: Area, name: &str) -> bool {
        self.dirs
            .get(&area)
            .is_some_and(|dir| dir.contains_key(name))
    }

    pub fn remove(&mut self, area: Area, name: &str) -> Option<Bytes> {
        self.dirs.get_mut(&area).and_then(|dir| dir.remove(name))
    }

    pub fn names(&self, area: Area) -> Vec<String> {
        self.dirs
            .get(&area)
            .map(|dir| dir.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn write_path(&mut self, path: &str, bytes: impl Into<Bytes>) -> Result<(), RunnerError> {
        let (area, name) = parse_path(path)?;
        self.write(area, name, bytes)
    }

    pub fn read_path(&self, path: &str) -> Result<Bytes, RunnerError> {
        let (area, name) = parse_path(path)?;
        self.read(area, name)
    }
}
