use crate::display::DisplayHandle;
use crate::error::{Failure, RunnerError};
use crate::store::Area;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type JobId = u64;

/// Suffix inserted between the input basename and its extension.
pub const OUTPUT_SUFFIX: &str = "Filtered";

pub const DEFAULT_INPUT_FILENAME: &str = "PacMan.png";
pub const DEFAULT_EXPONENT: f64 = 2.0;

/// Weickert enhancement applied by the native filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffusionType {
    Isotropic,
    #[serde(rename = "CED")]
    Ced,
    #[serde(rename = "cCED")]
    CCed,
    #[serde(rename = "EED")]
    Eed,
    #[serde(rename = "cEED")]
    CEed,
}

impl DiffusionType {
    pub const ALL: [DiffusionType; 5] = [
        DiffusionType::Isotropic,
        DiffusionType::Ced,
        DiffusionType::CCed,
        DiffusionType::Eed,
        DiffusionType::CEed,
    ];

    /// Name understood by the native filter's command line.
    pub fn as_str(self) -> &'static str {
        match self {
            DiffusionType::Isotropic => "Isotropic",
            DiffusionType::Ced => "CED",
            DiffusionType::CCed => "cCED",
            DiffusionType::Eed => "EED",
            DiffusionType::CEed => "cEED",
        }
    }
}

impl fmt::Display for DiffusionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiffusionType {
    type Err = RunnerError;

    // Case-sensitive: "cEED" and "CED" are distinct enhancements.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiffusionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                RunnerError::config(
                    "diffusion_type",
                    format!("unrecognized diffusion type {s:?} (expected Isotropic, CED, cCED, EED or cEED)"),
                )
            })
    }
}

/// Fields a UI control (or a preset) can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterField {
    InputFilename,
    OutputFilename,
    DiffusionTime,
    Lambda,
    DiffusionType,
    NoiseScale,
    FeatureScale,
    Exponent,
}

impl ParameterField {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterField::InputFilename => "input_filename",
            ParameterField::OutputFilename => "output_filename",
            ParameterField::DiffusionTime => "diffusion_time",
            ParameterField::Lambda => "lambda",
            ParameterField::DiffusionType => "diffusion_type",
            ParameterField::NoiseScale => "noise_scale",
            ParameterField::FeatureScale => "feature_scale",
            ParameterField::Exponent => "exponent",
        }
    }
}

impl FromStr for ParameterField {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s.replace('-', "_").as_str() {
            "input_filename" | "input" => ParameterField::InputFilename,
            "output_filename" | "output" => ParameterField::OutputFilename,
            "diffusion_time" => ParameterField::DiffusionTime,
            "lambda" => ParameterField::Lambda,
            "diffusion_type" => ParameterField::DiffusionType,
            "noise_scale" => ParameterField::NoiseScale,
            "feature_scale" => ParameterField::FeatureScale,
            "exponent" => ParameterField::Exponent,
            _ => {
                return Err(RunnerError::config(
                    "field",
                    format!("unknown parameter {s:?}"),
                ))
            }
        };
        Ok(field)
    }
}

/// A single typed edit to the parameter model.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterUpdate {
    InputFilename(String),
    /// `None` clears an override and returns to the derived name.
    OutputFilename(Option<String>),
    DiffusionTime(f64),
    Lambda(f64),
    DiffusionType(DiffusionType),
    NoiseScale(f64),
    FeatureScale(f64),
    Exponent(f64),
}

impl ParameterUpdate {
    /// Parse a raw control value for `field`.
    pub fn parse(field: ParameterField, value: &str) -> Result<Self, RunnerError> {
        let number = |field: ParameterField| -> Result<f64, RunnerError> {
            value.trim().parse::<f64>().map_err(|_| {
                RunnerError::config(field.as_str(), format!("{value:?} is not a number"))
            })
        };
        Ok(match field {
            ParameterField::InputFilename => ParameterUpdate::InputFilename(value.to_string()),
            ParameterField::OutputFilename => {
                let v = value.trim();
                ParameterUpdate::OutputFilename((!v.is_empty()).then(|| v.to_string()))
            }
            ParameterField::DiffusionTime => ParameterUpdate::DiffusionTime(number(field)?),
            ParameterField::Lambda => ParameterUpdate::Lambda(number(field)?),
            ParameterField::DiffusionType => ParameterUpdate::DiffusionType(value.trim().parse()?),
            ParameterField::NoiseScale => ParameterUpdate::NoiseScale(number(field)?),
            ParameterField::FeatureScale => ParameterUpdate::FeatureScale(number(field)?),
            ParameterField::Exponent => ParameterUpdate::Exponent(number(field)?),
        })
    }
}

fn default_exponent() -> f64 {
    DEFAULT_EXPONENT
}

/// Configuration for one filter invocation.
///
/// The controller keeps a working copy that UI edits mutate; every submission
/// clones it, so a job in flight never observes later edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameters {
    pub input_filename: String,
    /// Explicit override; the derived name is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    pub diffusion_time: f64,
    pub lambda: f64,
    pub diffusion_type: DiffusionType,
    pub noise_scale: f64,
    pub feature_scale: f64,
    #[serde(default = "default_exponent")]
    pub exponent: f64,
}

impl Default for FilterParameters {
    fn default() -> Self {
        Self {
            input_filename: DEFAULT_INPUT_FILENAME.to_string(),
            output_filename: None,
            diffusion_time: 20.0,
            lambda: 0.05,
            diffusion_type: DiffusionType::CEed,
            noise_scale: 3.0,
            feature_scale: 2.0,
            exponent: DEFAULT_EXPONENT,
        }
    }
}

impl FilterParameters {
    /// Apply one update. The model is left untouched when validation fails.
    pub fn set(&mut self, update: ParameterUpdate) -> Result<(), RunnerError> {
        let mut next = self.clone();
        match update {
            ParameterUpdate::InputFilename(v) => next.input_filename = v,
            ParameterUpdate::OutputFilename(v) => next.output_filename = v,
            ParameterUpdate::DiffusionTime(v) => next.diffusion_time = v,
            ParameterUpdate::Lambda(v) => next.lambda = v,
            ParameterUpdate::DiffusionType(v) => next.diffusion_type = v,
            ParameterUpdate::NoiseScale(v) => next.noise_scale = v,
            ParameterUpdate::FeatureScale(v) => next.feature_scale = v,
            ParameterUpdate::Exponent(v) => next.exponent = v,
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Parse and apply a raw control value.
    pub fn set_str(&mut self, field: ParameterField, value: &str) -> Result<(), RunnerError> {
        self.set(ParameterUpdate::parse(field, value)?)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        validate_filename("input_filename", &self.input_filename)?;
        if let Some(name) = self.output_filename.as_deref() {
            validate_filename("output_filename", name)?;
            if name == self.input_filename {
                return Err(RunnerError::config(
                    "output_filename",
                    "must differ from the input filename",
                ));
            }
        }
        positive("diffusion_time", self.diffusion_time)?;
        positive("lambda", self.lambda)?;
        non_negative("noise_scale", self.noise_scale)?;
        non_negative("feature_scale", self.feature_scale)?;
        non_zero("exponent", self.exponent)?;
        Ok(())
    }

    /// Name the filtered image is staged and downloaded under.
    pub fn output_filename(&self) -> String {
        self.output_filename
            .clone()
            .unwrap_or_else(|| derive_output_filename(&self.input_filename))
    }

    pub fn input_path(&self) -> String {
        Area::Raw.path(&self.input_filename)
    }

    pub fn output_path(&self) -> String {
        Area::Raw.path(&self.output_filename())
    }

    /// Positional arguments for the compute backend:
    /// `[input, output, diffusion_time, lambda, diffusion_type, noise_scale, feature_scale, exponent]`.
    pub fn to_argument_list(&self) -> Vec<String> {
        vec![
            self.input_path(),
            self.output_path(),
            canonical_number(self.diffusion_time),
            canonical_number(self.lambda),
            self.diffusion_type.as_str().to_string(),
            canonical_number(self.noise_scale),
            canonical_number(self.feature_scale),
            canonical_number(self.exponent),
        ]
    }
}

/// `"a.b.png"` becomes `"a.bFiltered.png"`; names without an extension get the suffix appended.
pub fn derive_output_filename(input: &str) -> String {
    match input.rsplit_once('.') {
        Some((base, ext)) => format!("{base}{OUTPUT_SUFFIX}.{ext}"),
        None => format!("{input}{OUTPUT_SUFFIX}"),
    }
}

/// Locale-independent shortest round-trip rendering.
pub fn canonical_number(value: f64) -> String {
    format!("{value}")
}

fn validate_filename(field: &'static str, name: &str) -> Result<(), RunnerError> {
    if name.trim().is_empty() {
        return Err(RunnerError::config(field, "must not be empty"));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(RunnerError::config(
            field,
            format!("{name:?} is not a plain file name"),
        ));
    }
    Ok(())
}

fn positive(field: &'static str, value: f64) -> Result<(), RunnerError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(RunnerError::config(
            field,
            format!("{value} must be a finite number greater than zero"),
        ));
    }
    Ok(())
}

fn non_zero(field: &'static str, value: f64) -> Result<(), RunnerError> {
    if !value.is_finite() || value == 0.0 {
        return Err(RunnerError::config(
            field,
            format!("{value} must be a finite, non-zero number"),
        ));
    }
    Ok(())
}

fn non_negative(field: &'static str, value: f64) -> Result<(), RunnerError> {
    if !value.is_finite() || value < 0.0 {
        return Err(RunnerError::config(
            field,
            format!("{value} must be a finite, non-negative number"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Staging,
    Running,
    Converting,
    Done,
    Failed,
}

impl JobState {
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            JobState::Staging | JobState::Running | JobState::Converting
        )
    }
}

/// One in-flight or completed execution.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub parameters: FilterParameters,
    pub state: JobState,
    pub progress: u8,
    pub output_bytes: Option<Bytes>,
    pub failure: Option<Failure>,
}

impl Job {
    pub fn new(id: JobId, parameters: FilterParameters) -> Self {
        Self {
            id,
            parameters,
            state: JobState::Idle,
            progress: 0,
            output_bytes: None,
            failure: None,
        }
    }
}

/// Events emitted by the controller for presentation layers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    StateChanged {
        job_id: JobId,
        state: JobState,
    },
    ProgressChanged {
        job_id: JobId,
        progress: u8,
    },
    InputReady {
        name: String,
        handle: DisplayHandle,
    },
    OutputReady {
        job_id: JobId,
        handle: DisplayHandle,
        download_name: String,
        // Box keeps the event small; output bytes are refcounted anyway.
        output: Box<Bytes>,
    },
    Failed {
        job_id: JobId,
        reason: Failure,
    },
    /// A command was rejected before any job was created.
    Rejected {
        reason: Failure,
    },
    Info(String),
}

/// Final report for non-interactive runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub timestamp_utc: String,
    pub job_id: JobId,
    pub backend: String,
    pub state: JobState,
    pub parameters: FilterParameters,
    pub output_filename: String,
    #[serde(default)]
    pub output_path: Option<std::path::PathBuf>,
    #[serde(default)]
    pub output_bytes: Option<usize>,
    #[serde(default)]
    pub failure: Option<Failure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn output_name_splits_on_last_dot() {
        assert_eq!(derive_output_filename("PacMan.png"), "PacManFiltered.png");
        assert_eq!(derive_output_filename("a.b.png"), "a.bFiltered.png");
        assert_eq!(derive_output_filename("noext"), "noextFiltered");
    }

    #[test]
    fn explicit_output_name_overrides_derivation() {
        let mut p = FilterParameters::default();
        p.set(ParameterUpdate::OutputFilename(Some("out.png".into())))
            .unwrap();
        assert_eq!(p.output_filename(), "out.png");
        p.set(ParameterUpdate::OutputFilename(None)).unwrap();
        assert_eq!(p.output_filename(), "PacManFiltered.png");
    }

    #[test]
    fn argument_list_order_and_paths() {
        let p = FilterParameters::default();
        assert_eq!(
            p.to_argument_list(),
            vec![
                "/raw/PacMan.png",
                "/raw/PacManFiltered.png",
                "20",
                "0.05",
                "cEED",
                "3",
                "2",
                "2"
            ]
        );
    }

    #[test]
    fn argument_list_numbers_parse_back_exactly() {
        let p = FilterParameters {
            input_filename: "x.png".into(),
            output_filename: None,
            diffusion_time: 0.1 + 0.2,
            lambda: 1.0e-7,
            diffusion_type: DiffusionType::CCed,
            noise_scale: 0.0,
            feature_scale: 123456.789,
            exponent: std::f64::consts::PI,
        };
        let args = p.to_argument_list();
        let parsed: Vec<f64> = [2, 3, 5, 6, 7]
            .iter()
            .map(|&i| args[i].parse::<f64>().unwrap())
            .collect();
        assert_eq!(
            parsed,
            vec![
                p.diffusion_time,
                p.lambda,
                p.noise_scale,
                p.feature_scale,
                p.exponent
            ]
        );
        assert_eq!(args[4].parse::<DiffusionType>().unwrap(), p.diffusion_type);
    }

    #[test]
    fn invalid_update_never_partially_applies() {
        let mut p = FilterParameters::default();
        let before = p.clone();
        let err = p.set(ParameterUpdate::Lambda(0.0)).unwrap_err();
        assert_matches!(err, RunnerError::Configuration { field: "lambda", .. });
        assert_eq!(p, before);

        let err = p
            .set_str(ParameterField::DiffusionType, "Anisotropic")
            .unwrap_err();
        assert_matches!(
            err,
            RunnerError::Configuration {
                field: "diffusion_type",
                ..
            }
        );
        assert_eq!(p, before);
    }

    #[test]
    fn set_str_parses_numbers_and_enum() {
        let mut p = FilterParameters::default();
        p.set_str("noise-scale".parse().unwrap(), "1.5").unwrap();
        p.set_str(ParameterField::DiffusionType, "EED").unwrap();
        assert_eq!(p.noise_scale, 1.5);
        assert_eq!(p.diffusion_type, DiffusionType::Eed);
        assert!(p.set_str(ParameterField::Exponent, "abc").is_err());
        assert!(p.set_str(ParameterField::DiffusionTime, "NaN").is_err());
    }

    #[test]
    fn exponent_may_be_negative_but_not_zero() {
        let mut p = FilterParameters::default();
        p.set(ParameterUpdate::Exponent(-1.0)).unwrap();
        assert_eq!(p.exponent, -1.0);
        assert_eq!(p.to_argument_list()[7], "-1");

        let err = p.set(ParameterUpdate::Exponent(0.0)).unwrap_err();
        assert_matches!(err, RunnerError::Configuration { field: "exponent", .. });
        assert!(p.set(ParameterUpdate::Exponent(f64::NAN)).is_err());
        assert_eq!(p.exponent, -1.0);
    }

    #[test]
    fn unknown_diffusion_type_fails_deserialization() {
        let json = r#"{"input_filename":"a.png","diffusion_time":1.0,"lambda":0.1,
            "diffusion_type":"Blur","noise_scale":1.0,"feature_scale":1.0}"#;
        assert!(serde_json::from_str::<FilterParameters>(json).is_err());
    }

    #[test]
    fn exponent_defaults_when_absent() {
        let json = r#"{"input_filename":"a.png","diffusion_time":1.0,"lambda":0.1,
            "diffusion_type":"cCED","noise_scale":1.0,"feature_scale":1.0}"#;
        let p: FilterParameters = serde_json::from_str(json).unwrap();
        assert_eq!(p.exponent, DEFAULT_EXPONENT);
        assert_eq!(p.diffusion_type, DiffusionType::CCed);
    }
}
