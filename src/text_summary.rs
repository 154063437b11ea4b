//! Text summary builder for CLI output.
//!
//! This module formats human-readable lines for text mode.

use crate::model::{canonical_number, JobState, RunSummary};
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from the final report and the progress samples seen during the run.
pub(crate) fn build_text_summary(
    summary: &RunSummary,
    progress_points: &[(f64, u8)],
    elapsed: Duration,
) -> TextSummary {
    let mut lines = Vec::new();
    let p = &summary.parameters;

    lines.push(format!("Job: #{} ({} backend)", summary.job_id, summary.backend));
    lines.push(format!("Input: {}", p.input_filename));
    lines.push(format!(
        "Parameters: type {} time {} lambda {} noise {} feature {} exponent {}",
        p.diffusion_type,
        canonical_number(p.diffusion_time),
        canonical_number(p.lambda),
        canonical_number(p.noise_scale),
        canonical_number(p.feature_scale),
        canonical_number(p.exponent),
    ));

    match summary.state {
        JobState::Done => {
            let bytes = summary
                .output_bytes
                .map(|n| format!("{n} bytes"))
                .unwrap_or_else(|| "-".into());
            lines.push(format!("Output: {} ({bytes})", summary.output_filename));
            if let Some(path) = summary.output_path.as_deref() {
                lines.push(format!("Saved: {}", path.display()));
            }
        }
        JobState::Failed => {
            let reason = summary
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".into());
            lines.push(format!("Failed: {reason}"));
        }
        other => lines.push(format!("State: {other:?}")),
    }

    // Intermediate samples only; the final reset to 0 is not a sample.
    let peak = progress_points.iter().map(|(_, p)| *p).max().unwrap_or(0);
    lines.push(format!(
        "Progress: {} updates, peak {}%",
        progress_points.len(),
        peak
    ));
    lines.push(format!("Elapsed: {:.2} s", elapsed.as_secs_f64()));

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Failure, RunnerError};
    use crate::model::FilterParameters;

    fn summary(state: JobState) -> RunSummary {
        RunSummary {
            timestamp_utc: "2024-01-01T00:00:00Z".into(),
            job_id: 4,
            backend: "worker".into(),
            state,
            parameters: FilterParameters::default(),
            output_filename: "PacManFiltered.png".into(),
            output_path: Some("out/PacManFiltered.png".into()),
            output_bytes: Some(1234),
            failure: None,
        }
    }

    #[test]
    fn done_run_lists_output_and_location() {
        let text = build_text_summary(
            &summary(JobState::Done),
            &[(0.1, 40), (0.2, 100)],
            Duration::from_millis(1500),
        );
        assert_eq!(text.lines[0], "Job: #4 (worker backend)");
        assert!(text
            .lines
            .contains(&"Parameters: type cEED time 20 lambda 0.05 noise 3 feature 2 exponent 2".to_string()));
        assert!(text
            .lines
            .contains(&"Output: PacManFiltered.png (1234 bytes)".to_string()));
        assert!(text.lines.contains(&"Progress: 2 updates, peak 100%".to_string()));
        assert_eq!(text.lines.last().map(String::as_str), Some("Elapsed: 1.50 s"));
    }

    #[test]
    fn failed_run_reports_reason() {
        let mut s = summary(JobState::Failed);
        s.failure = Some(Failure::from(RunnerError::Transport("timed out".into())));
        let text = build_text_summary(&s, &[], Duration::ZERO);
        assert!(text.lines.iter().any(|l| l.starts_with("Failed: ")));
        assert!(!text.lines.iter().any(|l| l.starts_with("Output:")));
    }
}
