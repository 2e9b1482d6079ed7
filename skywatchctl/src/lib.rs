use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use skywatch_core::{
    format_seconds, load_skywatch_config, platform_client, should_be_on, seconds_since_midnight,
    AstronomicalTimes, AstronomySource, CleanupJob, CleanupReport, Clock, DurationCache,
    HealthProbe, LivenessProbes, ReconcileReport, ReconcileSettings, Reconciler,
    RemoteHealthProbe, RemoteStateGateway, ScheduleEvaluator, ScheduleWindow, SignalKind,
    SkywatchConfig, SystemClock, Verdict, VideoPlatform,
};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] skywatch_core::ConfigError),
    #[error("schedule error: {0}")]
    Schedule(#[from] skywatch_core::ScheduleError),
    #[error("astronomy error: {0}")]
    Astronomy(#[from] skywatch_core::AstronomyError),
    #[error("remote error: {0}")]
    Gateway(#[from] skywatch_core::GatewayError),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] skywatch_core::ReconcileError),
    #[error("cleanup error: {0}")]
    Cleanup(#[from] skywatch_core::CleanupError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Skywatch live-stream reconciler", long_about = None)]
pub struct Cli {
    /// Path to skywatch.toml
    #[arg(long, default_value = "configs/skywatch.toml")]
    pub config: PathBuf,
    /// Overrides station.state_dir
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
    /// Compute actions without touching remote state
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Debug logging (RUST_LOG wins when set)
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs one full reconciliation pass
    Run,
    /// Prints today's on-air window
    Schedule,
    /// Samples every health signal once
    Probe,
    /// Deletes expired or aborted uploads
    Cleanup,
    /// Generates shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Installs the global fmt subscriber. Logs go to stderr so JSON output on
/// stdout stays parseable.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(args.shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(&cli, &context))
}

async fn dispatch(cli: &Cli, context: &AppContext) -> Result<()> {
    match &cli.command {
        Commands::Run => {
            let report = context.reconcile().await?;
            render(&report, cli.format)?;
        }
        Commands::Schedule => {
            let summary = context.schedule_summary(context.clock.now()).await?;
            render(&summary, cli.format)?;
        }
        Commands::Probe => {
            let probes = context.probe_once().await?;
            render(&probes, cli.format)?;
        }
        Commands::Cleanup => {
            let report = context.cleanup().await?;
            render(&report, cli.format)?;
        }
        Commands::Completions(_) => {}
    }
    Ok(())
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

struct AppContext {
    config: SkywatchConfig,
    dry_run: bool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("station", &self.config.station.name)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_skywatch_config(&cli.config)?;
        if let Some(state_dir) = &cli.state_dir {
            config.station.state_dir = state_dir.to_string_lossy().to_string();
        }
        info!(
            station = %config.station.name,
            config = %cli.config.display(),
            "configuration loaded"
        );
        Ok(Self {
            config,
            dry_run: cli.dry_run,
            clock: Arc::new(SystemClock),
        })
    }

    async fn window_at(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<(AstronomicalTimes, ScheduleWindow)> {
        let source = AstronomySource::from_config(&self.config, None)?;
        let times = source.refresh(now).await?;
        let window = ScheduleEvaluator::new(self.config.schedule.clone())
            .compute_window(now.date_naive(), &times)?;
        Ok((times, window))
    }

    async fn schedule_summary(&self, now: DateTime<FixedOffset>) -> Result<ScheduleSummary> {
        let (times, window) = self.window_at(now).await?;
        Ok(ScheduleSummary::new(now, &times, &window))
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let (_, window) = self.window_at(self.clock.now()).await?;
        let gateway = RemoteStateGateway::from_config(&self.config)?;
        let probes = LivenessProbes::from_config(&self.config, None)?;
        let mut settings = ReconcileSettings::from_config(&self.config);
        settings.dry_run = self.dry_run;
        let reconciler = Reconciler::new(settings, window, gateway, probes, self.clock.clone());
        Ok(reconciler.run().await?)
    }

    async fn probe_once(&self) -> Result<Vec<ProbeLine>> {
        let probes = LivenessProbes::from_config(&self.config, None)?;
        let mut lines = vec![
            ProbeLine::sample(probes.network.as_ref()).await,
            ProbeLine::sample(probes.stream.as_ref()).await,
        ];
        let platform: Arc<dyn VideoPlatform> = Arc::new(platform_client(&self.config)?);
        let bound = platform
            .current_broadcast()
            .await?
            .and_then(|broadcast| broadcast.bound_stream_id);
        match bound {
            Some(stream_id) => {
                let remote = RemoteHealthProbe::new(platform, stream_id);
                lines.push(ProbeLine::sample(&remote).await);
            }
            None => lines.push(ProbeLine {
                signal: SignalKind::RemoteHealth,
                verdict: Verdict::Down,
                reason: Some("no bound broadcast".into()),
            }),
        }
        Ok(lines)
    }

    async fn cleanup(&self) -> Result<CleanupReport> {
        let section = self.config.cleanup.clone();
        let cache = DurationCache::open(self.config.resolve_path(&section.duration_cache))?;
        let platform = Arc::new(platform_client(&self.config)?);
        let mut job = CleanupJob::new(platform, section, cache, self.dry_run);
        let now = self.clock.now().with_timezone(&Utc);
        Ok(job.run(now).await?)
    }
}

#[derive(Debug, Serialize)]
pub struct ScheduleSummary {
    pub date: NaiveDate,
    pub now: String,
    pub sunrise: String,
    pub sunset: String,
    pub activation: String,
    pub deactivation: String,
    pub max_segment_minutes: u64,
    pub grace_minutes: u64,
    pub midday_split: bool,
    pub should_be_on: bool,
}

impl ScheduleSummary {
    fn new(now: DateTime<FixedOffset>, times: &AstronomicalTimes, window: &ScheduleWindow) -> Self {
        let seconds = seconds_since_midnight(now.time());
        Self {
            date: window.date,
            now: format_seconds(seconds),
            sunrise: format_seconds(times.sunrise),
            sunset: format_seconds(times.sunset),
            activation: format_seconds(window.activation),
            deactivation: format_seconds(window.deactivation),
            max_segment_minutes: window.max_segment.as_secs() / 60,
            grace_minutes: window.grace.as_secs() / 60,
            midday_split: window.midday_split,
            should_be_on: should_be_on(seconds, window),
        }
    }
}

impl DisplayFallback for ScheduleSummary {
    fn display(&self) -> String {
        let state = if self.should_be_on { "on" } else { "off" };
        let mut lines = vec![
            format!("Date: {}", self.date),
            format!("Sunrise/sunset: {} / {}", self.sunrise, self.sunset),
            format!("Window: {} - {}", self.activation, self.deactivation),
            format!(
                "Segments: max {} min, grace {} min",
                self.max_segment_minutes, self.grace_minutes
            ),
        ];
        if self.midday_split {
            lines.push("Midday split: enabled".to_string());
        }
        lines.push(format!("Now {}: should be {state}", self.now));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeLine {
    pub signal: SignalKind,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProbeLine {
    async fn sample(probe: &dyn HealthProbe) -> Self {
        let started = Instant::now();
        let result = probe.probe().await;
        debug!(
            signal = ?probe.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "probe sampled"
        );
        Self {
            signal: probe.kind(),
            verdict: result.verdict,
            reason: result.reason,
        }
    }
}

impl DisplayFallback for Vec<ProbeLine> {
    fn display(&self) -> String {
        self.iter()
            .map(|line| match &line.reason {
                Some(reason) => format!("[{}] {:?}: {reason}", line.verdict, line.signal),
                None => format!("[{}] {:?}", line.verdict, line.signal),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for ReconcileReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Pass at {} (should be {}){}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            if self.should_be_on { "on" } else { "off" },
            if self.dry_run { " [dry run]" } else { "" }
        )];
        if self.actions.is_empty() {
            lines.push("Actions: none".to_string());
        } else {
            lines.push("Actions:".to_string());
            for action in &self.actions {
                lines.push(format!("  - {action:?}"));
            }
        }
        for state in &self.verdicts {
            lines.push(format!(
                "Signal {:?}: {} after {} sample(s)",
                state.signal, state.settled, state.samples
            ));
        }
        if let Some(verdict) = self.remote_health {
            lines.push(format!("Platform health: {verdict}"));
        }
        if let Some(recovery) = self.recovery {
            lines.push(format!(
                "Network recovery: {} after {} retries",
                if recovery.recovered { "recovered" } else { "gave up" },
                recovery.retries_used
            ));
        }
        for note in &self.observations {
            lines.push(format!("  * {note}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for CleanupReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Scanned {} videos, kept {}, skipped {} live{}",
            self.scanned,
            self.kept,
            self.skipped_live,
            if self.dry_run { " [dry run]" } else { "" }
        )];
        for deletion in &self.deleted {
            lines.push(format!(
                "  - {} {:?} ({})",
                deletion.video_id, deletion.reason, deletion.title
            ));
        }
        lines.join("\n")
    }
}
