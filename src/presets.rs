//! Guided-demo scenarios: each `(scenario, variant)` pair names an input image
//! and a complete parameter set.

use crate::error::RunnerError;
use crate::model::{DiffusionType, FilterParameters};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preset {
    pub scenario: u32,
    pub scenario_name: &'static str,
    pub variant: u32,
    pub variant_name: &'static str,
    pub input_filename: &'static str,
    pub diffusion_time: f64,
    pub lambda: f64,
    pub diffusion_type: DiffusionType,
    pub noise_scale: f64,
    pub feature_scale: f64,
    pub exponent: f64,
}

impl Preset {
    /// Full parameter set, output name derived from the preset's input.
    pub fn parameters(&self) -> FilterParameters {
        FilterParameters {
            input_filename: self.input_filename.to_string(),
            output_filename: None,
            diffusion_time: self.diffusion_time,
            lambda: self.lambda,
            diffusion_type: self.diffusion_type,
            noise_scale: self.noise_scale,
            feature_scale: self.feature_scale,
            exponent: self.exponent,
        }
    }
}

#[allow(clippy::too_many_arguments)]
const fn preset(
    scenario: u32,
    scenario_name: &'static str,
    variant: u32,
    variant_name: &'static str,
    input_filename: &'static str,
    diffusion_time: f64,
    lambda: f64,
    diffusion_type: DiffusionType,
    noise_scale: f64,
    feature_scale: f64,
    exponent: f64,
) -> Preset {
    Preset {
        scenario,
        scenario_name,
        variant,
        variant_name,
        input_filename,
        diffusion_time,
        lambda,
        diffusion_type,
        noise_scale,
        feature_scale,
        exponent,
    }
}

// Triangle runs with Weickert's exponent 4; the other scenes use 2.
#[rustfmt::skip]
static PRESETS: &[Preset] = &[
    preset(1, "Fingerprint", 1, "Isotropic", "Fingerprint.png", 2.0, 0.05, DiffusionType::Isotropic, 1.0, 2.0, 2.0),
    preset(1, "Fingerprint", 2, "CED", "Fingerprint.png", 20.0, 0.01, DiffusionType::Ced, 1.0, 4.0, 2.0),
    preset(1, "Fingerprint", 3, "cCED", "Fingerprint.png", 20.0, 0.01, DiffusionType::CCed, 1.0, 4.0, 2.0),
    preset(2, "PacMan", 1, "EED", "PacMan.png", 20.0, 0.05, DiffusionType::Eed, 3.0, 2.0, 2.0),
    preset(2, "PacMan", 2, "cEED", "PacMan.png", 20.0, 0.05, DiffusionType::CEed, 3.0, 2.0, 2.0),
    preset(2, "PacMan", 3, "Isotropic", "PacMan.png", 20.0, 0.05, DiffusionType::Isotropic, 3.0, 2.0, 2.0),
    preset(3, "Triangle", 1, "EED", "Triangle.png", 5.0, 0.001, DiffusionType::Eed, 0.5, 2.0, 4.0),
    preset(3, "Triangle", 2, "cEED", "Triangle.png", 5.0, 0.001, DiffusionType::CEed, 0.5, 2.0, 4.0),
];

pub fn all() -> &'static [Preset] {
    PRESETS
}

pub fn lookup(scenario: u32, variant: u32) -> Result<&'static Preset, RunnerError> {
    PRESETS
        .iter()
        .find(|p| p.scenario == scenario && p.variant == variant)
        .ok_or(RunnerError::UnknownPreset { scenario, variant })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn pacman_ceed_matches_page_defaults() {
        let p = lookup(2, 2).unwrap();
        assert_eq!(p.scenario_name, "PacMan");
        assert_eq!(p.variant_name, "cEED");
        let params = p.parameters();
        assert_eq!(params.input_filename, "PacMan.png");
        assert_eq!(params.diffusion_time, 20.0);
        assert_eq!(params.lambda, 0.05);
        assert_eq!(params.diffusion_type, DiffusionType::CEed);
        assert_eq!(params.noise_scale, 3.0);
        assert_eq!(params.feature_scale, 2.0);
        assert_eq!(params.exponent, 2.0);
        assert_eq!(params, FilterParameters::default());
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        assert_matches!(
            lookup(2, 9),
            Err(RunnerError::UnknownPreset {
                scenario: 2,
                variant: 9
            })
        );
        assert_matches!(lookup(42, 1), Err(RunnerError::UnknownPreset { .. }));
    }

    #[test]
    fn every_preset_is_valid_and_unique() {
        for (i, p) in all().iter().enumerate() {
            p.parameters().validate().unwrap();
            assert!(all()[i + 1..]
                .iter()
                .all(|q| (q.scenario, q.variant) != (p.scenario, p.variant)));
        }
    }
}
