use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use matchcast_core::{
    format_hms, load_pipeline_config, parse_timecode, CollaboratorError, ContextError,
    FfmpegMuxer, HttpDetector, HttpGenerator, HttpSynthesizer, IntervalSplitter, MatchContext,
    Pipeline, PipelineConfig, PipelineError, PipelineState, ProgressEvent, RunRequest,
    RunSummary, SessionJanitor, Synthesizer,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] matchcast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("collaborator setup failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("match context error: {0}")]
    Context(#[from] ContextError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("cleanup error: {0}")]
    Cleanup(#[from] matchcast_core::JanitorError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("run ended in state {0}")]
    Incomplete(PipelineState),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Streaming match commentary control interface", long_about = None)]
pub struct Cli {
    /// Path to matchcast.toml
    #[arg(long, default_value = "configs/matchcast.toml")]
    pub config: PathBuf,
    /// Team sheet JSON, overrides collaborators.match_context
    #[arg(long)]
    pub match_context: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Narrate a video and stream progress until the run ends
    Run(RunArgs),
    /// Show how a video of the given length is split for analysis
    Intervals(IntervalsArgs),
    /// Remove expired session directories and final videos
    Cleanup(CleanupArgs),
    /// Print shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source video
    pub video: PathBuf,
    /// Fixed session id instead of a generated one
    #[arg(long)]
    pub session_id: Option<String>,
    /// Skip concatenating the final video
    #[arg(long, default_value_t = false)]
    pub no_final: bool,
    /// Emit progress as server-sent event frames
    #[arg(long, default_value_t = false)]
    pub sse: bool,
}

#[derive(Args, Debug)]
pub struct IntervalsArgs {
    /// Video length as HH:MM:SS, MM:SS or seconds
    #[arg(long)]
    pub duration: String,
    /// Window length in seconds, overrides intervals.window_seconds
    #[arg(long)]
    pub window: Option<f64>,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Retention in hours, overrides cleanup.retention_hours
    #[arg(long)]
    pub retention_hours: Option<u64>,
    /// Report what would be removed without deleting
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "matchcastctl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let config = load_pipeline_config(&cli.config)?;
    match &cli.command {
        Commands::Run(args) => {
            let pipeline = build_pipeline(config, cli.match_context.as_deref())?;
            let report = stream_run(&pipeline, args, cli.format).await?;
            if cli.format == OutputFormat::Text && !args.sse {
                render(&report, cli.format)?;
            }
            if report.state != PipelineState::Complete {
                return Err(AppError::Incomplete(report.state));
            }
        }
        Commands::Intervals(args) => {
            let plan = plan_intervals(&config, args)?;
            render(&plan, cli.format)?;
        }
        Commands::Cleanup(args) => {
            let report = cleanup(&config, args)?;
            render(&report, cli.format)?;
        }
        Commands::Completions(_) => {}
    }
    Ok(())
}

fn api_key(variable: Option<&str>) -> Option<String> {
    let variable = variable?;
    match std::env::var(variable) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            warn!(variable, "api key variable not set, calling collaborator without it");
            None
        }
    }
}

fn load_context(config: &PipelineConfig, path: Option<&std::path::Path>) -> Result<Option<String>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match &config.collaborators.match_context {
            Some(path) => config.resolve_path(path),
            None => return Ok(None),
        },
    };
    let context = MatchContext::load(&path)?;
    info!(path = %path.display(), teams = context.teams.len(), "match context loaded");
    Ok(context.format_for_prompt())
}

/// Wires the HTTP collaborators and the ffmpeg muxer from configuration.
pub fn build_pipeline(
    config: PipelineConfig,
    context_path: Option<&std::path::Path>,
) -> Result<Pipeline> {
    let collaborators = &config.collaborators;
    let timeout = Duration::from_secs(collaborators.request_timeout_seconds);
    let model_key = api_key(collaborators.api_key_env.as_deref());
    let context = load_context(&config, context_path)?;

    let detector = HttpDetector::new(&collaborators.detection_endpoint, timeout)?
        .with_api_key(model_key.clone())
        .with_context(context.clone());
    let generator = HttpGenerator::new(&collaborators.generation_endpoint, timeout)?
        .with_api_key(model_key);
    let synthesizer: Option<Arc<dyn Synthesizer>> = if config.synthesis.enabled {
        let synthesizer = HttpSynthesizer::new(
            &collaborators.synthesis_endpoint,
            timeout,
            config.synthesis.voices.clone(),
            config.synthesis.model_id.clone(),
        )?
        .with_api_key(api_key(collaborators.synthesis_api_key_env.as_deref()));
        Some(Arc::new(synthesizer))
    } else {
        None
    };
    let muxer = FfmpegMuxer::new(&config.muxing);

    Ok(Pipeline::new(
        config,
        Arc::new(detector),
        Arc::new(generator),
        Arc::new(muxer),
    )
    .with_synthesizer(synthesizer)
    .with_context(context))
}

/// Forwards every progress event to stdout as it arrives. Ctrl-C cancels
/// the run.
pub async fn stream_run(
    pipeline: &Pipeline,
    args: &RunArgs,
    format: OutputFormat,
) -> Result<RunReport> {
    let request = RunRequest {
        video: args.video.clone(),
        session_id: args.session_id.clone(),
        concat_final: args.no_final.then_some(false),
    };
    let (mut events, handle) = pipeline.start(request).into_parts();
    info!(session = handle.session_id(), "run started");

    let cancel = handle.cancellation();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        let frame = if args.sse {
            event.to_sse_frame()?
        } else {
            match format {
                OutputFormat::Json => event.to_json_line()?,
                OutputFormat::Text => format!("{}\n", describe_event(&event)),
            }
        };
        stdout.write_all(frame.as_bytes())?;
        stdout.flush()?;
    }

    let summary = handle.wait().await;
    interrupt.abort();
    Ok(RunReport::from(summary?))
}

pub fn describe_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Status { message, progress } => format!("[{progress:>3}%] {message}"),
        ProgressEvent::ChunkReady {
            index,
            url,
            start_time,
            end_time,
            progress,
        } => format!("[{progress:>3}%] chunk {index} {start_time}-{end_time} {url}"),
        ProgressEvent::Complete {
            chunks,
            final_video,
            progress,
        } => {
            if final_video.is_empty() {
                format!("[{progress:>3}%] complete: {chunks} chunks")
            } else {
                format!("[{progress:>3}%] complete: {chunks} chunks, final video {final_video}")
            }
        }
        ProgressEvent::Warning { message } => format!("warning: {message}"),
        ProgressEvent::Error { message } => format!("error: {message}"),
    }
}

pub fn plan_intervals(config: &PipelineConfig, args: &IntervalsArgs) -> Result<IntervalPlan> {
    let duration = parse_timecode(&args.duration)
        .map_err(|err| AppError::InvalidArgument(format!("--duration: {err}")))?;
    let window = args.window.unwrap_or(config.intervals.window_seconds);
    let splitter = IntervalSplitter::from_seconds(duration.as_secs_f64(), window)
        .map_err(|err| AppError::InvalidArgument(err.to_string()))?;
    Ok(IntervalPlan {
        duration: format_hms(duration),
        window_seconds: window,
        expected_segments: splitter.expected_segments(),
        intervals: splitter
            .iter()
            .map(|interval| IntervalRow {
                index: interval.index,
                start: format_hms(interval.start),
                end: format_hms(interval.end),
                seconds: interval.length().as_secs_f64(),
            })
            .collect(),
    })
}

pub fn cleanup(config: &PipelineConfig, args: &CleanupArgs) -> Result<CleanupReport> {
    let mut janitor = SessionJanitor::from_config(config).dry_run(args.dry_run);
    if let Some(hours) = args.retention_hours {
        janitor = janitor.with_retention(Duration::from_secs(hours * 3600));
    }
    let report = janitor.sweep()?;
    Ok(CleanupReport {
        dry_run: args.dry_run,
        removed: report.removed,
        kept: report.kept,
        failed: report.failed,
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub state: PipelineState,
    pub chunks: usize,
    pub narrated_chunks: usize,
    pub utterances: usize,
    pub events: usize,
    pub warnings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_video: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

impl From<RunSummary> for RunReport {
    fn from(summary: RunSummary) -> Self {
        Self {
            narrated_chunks: summary.segments.iter().filter(|s| s.narrated).count(),
            chunks: summary.segments.len(),
            session_id: summary.session_id,
            state: summary.state,
            utterances: summary.utterances,
            events: summary.events,
            warnings: summary.warnings,
            final_video: summary.final_video,
            manifest: summary.manifest,
        }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Session {} ({})", self.session_id, self.state),
            format!(
                "  - Chunks: {} ({} narrated)",
                self.chunks, self.narrated_chunks
            ),
            format!("  - Events: {}", self.events),
            format!("  - Utterances: {}", self.utterances),
            format!("  - Warnings: {}", self.warnings),
        ];
        if let Some(path) = &self.final_video {
            lines.push(format!("  - Final video: {}", path.display()));
        }
        if let Some(path) = &self.manifest {
            lines.push(format!("  - Manifest: {}", path.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct IntervalPlan {
    pub duration: String,
    pub window_seconds: f64,
    pub expected_segments: usize,
    pub intervals: Vec<IntervalRow>,
}

#[derive(Debug, Serialize)]
pub struct IntervalRow {
    pub index: usize,
    pub start: String,
    pub end: String,
    pub seconds: f64,
}

impl DisplayFallback for IntervalPlan {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} in {}s windows, {} intervals, ~{} segments expected",
            self.duration,
            self.window_seconds,
            self.intervals.len(),
            self.expected_segments
        )];
        for row in &self.intervals {
            lines.push(format!(
                "  #{} {} - {} ({:.1}s)",
                row.index + 1,
                row.start,
                row.end,
                row.seconds
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failed: usize,
}

impl DisplayFallback for CleanupReport {
    fn display(&self) -> String {
        let verb = if self.dry_run { "Would remove" } else { "Removed" };
        let mut lines = vec![format!(
            "{verb} {} entries, kept {}, failed {}",
            self.removed.len(),
            self.kept,
            self.failed
        )];
        for path in &self.removed {
            lines.push(format!("  - {}", path.display()));
        }
        lines.join("\n")
    }
}
