use crate::display::HostCapabilities;
use crate::engine::{create_backend, BackendKind};
use crate::error::Failure;
use crate::model::{DiffusionType, FilterParameters, JobEvent, JobState, RunSummary};
use crate::native::{
    ComputeBackend, ConversionBackend, PassthroughConverter, ProcessComputeBackend,
    ProcessConverter,
};
use crate::orchestrator::{run_controller, save_output, ControllerParts, JobController, UiCommand};
use crate::source::{DirImageSource, HttpImageSource, ImageSource, InputSource};
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendChoice {
    /// Worker thread when the host has more than one hardware thread
    Auto,
    Inline,
    Worker,
}

impl BackendChoice {
    fn preference(self) -> Option<BackendKind> {
        match self {
            BackendChoice::Auto => None,
            BackendChoice::Inline => Some(BackendKind::Inline),
            BackendChoice::Worker => Some(BackendKind::Worker),
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "diffusion-runner",
    version,
    about = "Run coherence-enhancing anisotropic diffusion filters on staged images"
)]
pub struct Cli {
    /// Input image name, resolved under the `images/` namespace
    #[arg(long, default_value = crate::model::DEFAULT_INPUT_FILENAME)]
    pub input: String,

    /// Read the input from a local file instead of the image source
    #[arg(long, conflicts_with = "input")]
    pub input_file: Option<PathBuf>,

    /// Base URL whose `images/` directory serves named inputs
    #[arg(long)]
    pub images_url: Option<String>,

    /// Local directory whose `images/` subdirectory serves named inputs (used without --images-url)
    #[arg(long, default_value = ".")]
    pub images_dir: PathBuf,

    /// Timeout for fetching a named input over HTTP
    #[arg(long, default_value = "30s")]
    pub fetch_timeout: humantime::Duration,

    /// Diffusion time
    #[arg(long, default_value_t = 20.0)]
    pub diffusion_time: f64,

    /// Contrast parameter lambda
    #[arg(long, default_value_t = 0.05)]
    pub lambda: f64,

    /// Diffusion type: Isotropic, CED, cCED, EED or cEED
    #[arg(long, default_value = "cEED")]
    pub diffusion_type: DiffusionType,

    /// Noise scale (sigma)
    #[arg(long, default_value_t = 3.0)]
    pub noise_scale: f64,

    /// Feature scale (rho)
    #[arg(long, default_value_t = 2.0)]
    pub feature_scale: f64,

    /// Exponent of the diffusivity function
    #[arg(long, default_value_t = crate::model::DEFAULT_EXPONENT)]
    pub exponent: f64,

    /// Output filename; derived from the input name when omitted
    #[arg(long)]
    pub output_name: Option<String>,

    /// Apply a guided-demo preset instead of the parameter flags
    #[arg(long, num_args = 2, value_names = ["SCENARIO", "VARIANT"])]
    pub preset: Option<Vec<u32>>,

    /// List available presets and exit
    #[arg(long)]
    pub list_presets: bool,

    /// Execution strategy
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto)]
    pub backend: BackendChoice,

    /// Native filter executable
    #[arg(long, default_value = "CoherenceEnhancingDiffusion")]
    pub filter_cmd: PathBuf,

    /// Native convert-and-resample executable; raw bytes are displayed as-is when omitted
    #[arg(long)]
    pub convert_cmd: Option<PathBuf>,

    /// Directory the filtered output is saved to
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Print JSON result and exit
    #[arg(long)]
    pub json: bool,

    /// Print text summary and exit
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Read commands from stdin (set, run, preset, show, quit)
    #[arg(long, conflicts_with_all = ["json", "silent"])]
    pub interactive: bool,
}

/// Everything a run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub parameters: FilterParameters,
    pub input: InputSource,
    pub preset: Option<(u32, u32)>,
    pub images_url: Option<String>,
    pub images_dir: PathBuf,
    pub fetch_timeout: Duration,
    pub backend: Option<BackendKind>,
    pub filter_cmd: PathBuf,
    pub convert_cmd: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Text,
    Json,
    Silent,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if args.list_presets {
        return list_presets();
    }

    let cfg = build_config(&args)?;

    if args.interactive {
        return run_interactive(cfg).await;
    }

    // Silent mode takes precedence over other output modes
    let mode = if args.silent {
        OutputMode::Silent
    } else if args.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    run_once(cfg, mode).await
}

/// Build a `RunnerConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<RunnerConfig> {
    let input = match args.input_file.as_deref() {
        Some(path) => read_input_file(path)?,
        None => InputSource::Named(args.input.clone()),
    };

    let parameters = FilterParameters {
        input_filename: input.name().to_string(),
        output_filename: args.output_name.clone(),
        diffusion_time: args.diffusion_time,
        lambda: args.lambda,
        diffusion_type: args.diffusion_type,
        noise_scale: args.noise_scale,
        feature_scale: args.feature_scale,
        exponent: args.exponent,
    };
    let preset = args.preset.as_deref().map(|sv| (sv[0], sv[1]));
    // Preset runs replace the flag values wholesale, so only check flags that will be used.
    if preset.is_none() {
        parameters.validate().context("invalid filter parameters")?;
    }

    Ok(RunnerConfig {
        parameters,
        input,
        preset,
        images_url: args.images_url.clone(),
        images_dir: args.images_dir.clone(),
        fetch_timeout: Duration::from(args.fetch_timeout),
        backend: args.backend.preference(),
        filter_cmd: args.filter_cmd.clone(),
        convert_cmd: args.convert_cmd.clone(),
        output_dir: args.output_dir.clone(),
        user_agent: format!("diffusion-runner/{}", env!("CARGO_PKG_VERSION")),
    })
}

fn read_input_file(path: &Path) -> Result<InputSource> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(InputSource::Supplied {
        name,
        data: Bytes::from(data),
    })
}

/// Wire the native collaborators and the chosen execution strategy into a controller.
fn build_controller(
    cfg: &RunnerConfig,
    event_tx: mpsc::UnboundedSender<JobEvent>,
) -> Result<JobController> {
    let compute: Arc<dyn ComputeBackend> =
        Arc::new(ProcessComputeBackend::new(cfg.filter_cmd.clone()));
    let converter: Arc<dyn ConversionBackend> = match cfg.convert_cmd.as_ref() {
        Some(program) => Arc::new(ProcessConverter::new(program.clone())),
        None => Arc::new(PassthroughConverter),
    };
    let images: Arc<dyn ImageSource> = match cfg.images_url.as_deref() {
        Some(url) => Arc::new(
            HttpImageSource::new(url, cfg.fetch_timeout, &cfg.user_agent)
                .context("failed to set up image source")?,
        ),
        None => Arc::new(DirImageSource::new(cfg.images_dir.clone())),
    };

    let kind = BackendKind::detect(cfg.backend);
    tracing::info!(backend = %kind, "execution strategy selected");
    let parts = ControllerParts {
        backend: create_backend(kind, compute),
        converter,
        images,
        host: HostCapabilities::default(),
    };
    // A preset run starts from defaults; the preset replaces them anyway.
    let initial = if cfg.preset.is_some() {
        FilterParameters::default()
    } else {
        cfg.parameters.clone()
    };
    JobController::new(parts, initial, event_tx).context("invalid initial parameters")
}

fn list_presets() -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for p in crate::presets::all() {
        let params = p.parameters();
        writeln!(
            out,
            "{} {}  {:<12} {:<10} {}",
            p.scenario,
            p.variant,
            p.scenario_name,
            p.variant_name,
            params.to_argument_list()[2..].join(" ")
        )?;
    }
    Ok(())
}

/// Turns controller events into output lines and saves downloads.
struct EventReporter {
    mode: OutputMode,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    output_dir: PathBuf,
    saved_path: Option<PathBuf>,
    rejection: Option<Failure>,
    progress_points: Vec<(f64, u8)>,
    started: Instant,
}

impl EventReporter {
    fn new(mode: OutputMode, out_tx: mpsc::UnboundedSender<OutputLine>, output_dir: PathBuf) -> Self {
        Self {
            mode,
            out_tx,
            output_dir,
            saved_path: None,
            rejection: None,
            progress_points: Vec::new(),
            started: Instant::now(),
        }
    }

    fn status(&self, line: String) {
        if self.mode == OutputMode::Text {
            let _ = self.out_tx.send(OutputLine::Stderr(line));
        }
    }

    fn handle(&mut self, ev: JobEvent) -> Result<()> {
        match ev {
            JobEvent::StateChanged { job_id, state } => {
                self.status(format!("== #{job_id} {state:?} =="));
            }
            JobEvent::ProgressChanged { job_id, progress } => {
                // The reset to 0 after completion is not a progress sample.
                if progress > 0 {
                    let elapsed = self.started.elapsed().as_secs_f64();
                    self.progress_points.push((elapsed, progress));
                    self.status(format!("#{job_id}: {progress}%"));
                }
            }
            JobEvent::InputReady { name, handle } => {
                self.status(format!("Input ready: {name} ({})", preview(handle.url())));
            }
            JobEvent::OutputReady {
                job_id,
                handle,
                download_name,
                output,
            } => {
                self.status(format!(
                    "#{job_id} output ready: {download_name} ({})",
                    preview(handle.url())
                ));
                let path = save_output(&self.output_dir, &download_name, &output)
                    .context("failed to save filtered output")?;
                self.status(format!("Saved: {}", path.display()));
                self.saved_path = Some(path);
            }
            JobEvent::Failed { job_id, reason } => {
                self.status(format!("#{job_id} failed: {reason}"));
            }
            JobEvent::Rejected { reason } => {
                self.status(format!("Rejected: {reason}"));
                self.rejection = Some(reason);
            }
            JobEvent::Info(info) => self.status(info),
        }
        Ok(())
    }
}

/// Data URIs can be huge; show only their prefix.
fn preview(url: &str) -> String {
    const MAX: usize = 48;
    if url.len() <= MAX {
        url.to_string()
    } else {
        let cut = (0..=MAX).rev().find(|&i| url.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &url[..cut])
    }
}

fn build_summary(controller: &JobController, saved_path: Option<PathBuf>) -> Result<RunSummary> {
    let job = controller.job();
    Ok(RunSummary {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .context("format timestamp")?,
        job_id: job.id,
        backend: controller.backend_kind().to_string(),
        state: job.state,
        parameters: job.parameters.clone(),
        output_filename: job.parameters.output_filename(),
        output_path: saved_path,
        output_bytes: job.output_bytes.as_ref().map(|b| b.len()),
        failure: job.failure.clone(),
    })
}

/// Submit one job (or preset), wait for it to settle, and report it.
async fn run_once(cfg: RunnerConfig, mode: OutputMode) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let mut controller = build_controller(&cfg, evt_tx)?;
    let first = match cfg.preset {
        Some((scenario, variant)) => UiCommand::ApplyPreset { scenario, variant },
        None => UiCommand::Submit(Some(cfg.input.clone())),
    };
    let _ = cmd_tx.send(first);
    let _ = cmd_tx.send(UiCommand::Quit);

    let mut reporter = EventReporter::new(mode, out_tx.clone(), cfg.output_dir.clone());
    let mut handle = tokio::spawn(async move {
        let outcome = run_controller(&mut controller, cmd_rx).await;
        outcome.map(|()| controller)
    });

    let controller = loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => reporter.handle(ev)?,
            res = &mut handle => break res.context("controller task failed")??,
        }
    };
    while let Ok(ev) = evt_rx.try_recv() {
        reporter.handle(ev)?;
    }

    let summary = build_summary(&controller, reporter.saved_path.take())?;
    let rejection = reporter.rejection.take();
    match mode {
        OutputMode::Json => {
            let out = serde_json::to_string_pretty(&summary)?;
            let _ = out_tx.send(OutputLine::Stdout(out));
        }
        OutputMode::Text => {
            let text = crate::text_summary::build_text_summary(
                &summary,
                &reporter.progress_points,
                reporter.started.elapsed(),
            );
            for line in text.lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
        OutputMode::Silent => {}
    }

    drop(reporter);
    drop(out_tx);
    let _ = out_handle.await;

    match summary.failure {
        Some(failure) if summary.state == JobState::Failed => Err(anyhow::anyhow!(
            "job #{} failed: {}",
            summary.job_id,
            failure
        )),
        _ if summary.state == JobState::Idle => match rejection {
            Some(reason) => Err(anyhow::anyhow!("no job was started: {reason}")),
            None => Err(anyhow::anyhow!("no job was started")),
        },
        _ => Ok(()),
    }
}

/// Parse one interactive line. `Ok(None)` means nothing to do.
pub fn parse_command(line: &str) -> Result<Option<UiCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let cmd = match (verb, rest.as_slice()) {
        ("set", [field, value]) => UiCommand::SetField {
            field: field.to_string(),
            value: value.to_string(),
        },
        ("run", []) => UiCommand::Submit(None),
        ("run", [name]) => UiCommand::Submit(Some(InputSource::Named(name.to_string()))),
        ("preset", [scenario, variant]) => {
            let scenario = scenario
                .parse()
                .map_err(|_| format!("bad scenario number: {scenario}"))?;
            let variant = variant
                .parse()
                .map_err(|_| format!("bad variant number: {variant}"))?;
            UiCommand::ApplyPreset { scenario, variant }
        }
        ("show", []) => UiCommand::Show,
        ("quit" | "exit", []) => UiCommand::Quit,
        _ => {
            return Err(format!(
                "unrecognised command `{}`; expected set <field> <value>, run [name], preset <s> <v>, show or quit",
                line.trim()
            ))
        }
    };
    Ok(Some(cmd))
}

/// Drive the controller from stdin; each `run` replaces the job before it.
async fn run_interactive(cfg: RunnerConfig) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let mut controller = build_controller(&cfg, evt_tx)?;
    // Supplied bytes exist nowhere else, so they are staged with a first run.
    match (cfg.preset, &cfg.input) {
        (Some((scenario, variant)), _) => {
            let _ = cmd_tx.send(UiCommand::ApplyPreset { scenario, variant });
        }
        (None, InputSource::Supplied { .. }) => {
            let _ = cmd_tx.send(UiCommand::Submit(Some(cfg.input.clone())));
        }
        (None, InputSource::Named(_)) => {}
    }

    let mut reporter = EventReporter::new(OutputMode::Text, out_tx.clone(), cfg.output_dir.clone());
    let mut handle = tokio::spawn(async move { run_controller(&mut controller, cmd_rx).await });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("read stdin")? {
                    Some(line) => match parse_command(&line) {
                        Ok(Some(cmd)) => {
                            let _ = cmd_tx.send(cmd);
                        }
                        Ok(None) => {}
                        Err(msg) => {
                            let _ = out_tx.send(OutputLine::Stderr(msg));
                        }
                    },
                    None => {
                        stdin_open = false;
                        let _ = cmd_tx.send(UiCommand::Quit);
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if stdin_open => {
                stdin_open = false;
                let _ = cmd_tx.send(UiCommand::Quit);
            }
            Some(ev) = evt_rx.recv() => reporter.handle(ev)?,
            res = &mut handle => {
                res.context("controller task failed")??;
                break;
            }
        }
    }
    while let Ok(ev) = evt_rx.try_recv() {
        reporter.handle(ev)?;
    }

    drop(reporter);
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_match_the_page() {
        let cli = Cli::parse_from(["diffusion-runner"]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.parameters, FilterParameters::default());
        assert_matches!(cfg.input, InputSource::Named(ref n) if n == "PacMan.png");
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(30));
        assert_eq!(cfg.backend, None);
    }

    #[test]
    fn flags_flow_into_parameters() {
        let cli = Cli::parse_from([
            "diffusion-runner",
            "--input",
            "Triangle.png",
            "--diffusion-type",
            "EED",
            "--exponent",
            "4",
            "--backend",
            "inline",
        ]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.parameters.diffusion_type, DiffusionType::Eed);
        assert_eq!(cfg.parameters.exponent, 4.0);
        assert_eq!(cfg.parameters.output_filename(), "TriangleFiltered.png");
        assert_eq!(cfg.backend, Some(BackendKind::Inline));
    }

    #[test]
    fn invalid_parameters_fail_config() {
        let cli = Cli::parse_from(["diffusion-runner", "--lambda", "0"]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn lowercase_diffusion_type_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["diffusion-runner", "--diffusion-type", "ceed"]).is_err());
    }

    #[test]
    fn preset_takes_two_numbers() {
        let cli = Cli::parse_from(["diffusion-runner", "--preset", "2", "1"]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.preset, Some((2, 1)));
    }

    #[test]
    fn input_file_is_supplied_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Custom.png");
        std::fs::write(&path, b"img").unwrap();
        let cli = Cli::parse_from(["diffusion-runner", "--input-file", path.to_str().unwrap()]);
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.parameters.input_filename, "Custom.png");
        assert_matches!(cfg.input, InputSource::Supplied { ref data, .. } if data.as_ref() == b"img");
    }

    #[test]
    fn interactive_commands_parse() {
        assert_matches!(
            parse_command("set lambda 0.1"),
            Ok(Some(UiCommand::SetField { ref field, ref value })) if field == "lambda" && value == "0.1"
        );
        assert_matches!(parse_command("run"), Ok(Some(UiCommand::Submit(None))));
        assert_matches!(
            parse_command("run Fingerprint.png"),
            Ok(Some(UiCommand::Submit(Some(InputSource::Named(ref n))))) if n == "Fingerprint.png"
        );
        assert_matches!(
            parse_command("preset 1 3"),
            Ok(Some(UiCommand::ApplyPreset {
                scenario: 1,
                variant: 3
            }))
        );
        assert_matches!(parse_command("  "), Ok(None));
        assert_matches!(parse_command("quit"), Ok(Some(UiCommand::Quit)));
        assert!(parse_command("preset x 1").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn long_urls_are_shortened() {
        let url = format!("data:image/png;base64,{}", "A".repeat(200));
        let shown = preview(&url);
        assert!(shown.ends_with("..."));
        assert!(shown.len() < 60);
        assert_eq!(preview("blob:diffusion-runner/1"), "blob:diffusion-runner/1");
    }
}
