//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use storysync_core::{
    EntityReport, ProgressReporter, PublishStatus, RunBudget, RunOptions, RunSummary, run_sync,
};
use storysync_crawler::{CompiledProfile, PageFetcher};
use storysync_discovery::{CatalogDiscoverer, DiscoveryOptions, read_priority_file};
use storysync_publish::{PublishOutcome, Publisher, build_sink};
use storysync_shared::{
    AppConfig, Snapshot, SyncConfig, init_config, load_config, load_config_from, resolve_sink,
};
use storysync_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// storysync: keep a local story catalog in sync with its source.
#[derive(Parser)]
#[command(
    name = "storysync",
    version,
    about = "Incrementally crawl a story catalog, merge new chapters and publish the snapshot.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.storysync/storysync.toml).
    #[arg(long, global = true, env = "STORYSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Discover, fetch, merge and publish.
    Run(RunArgs),

    /// Print the entry URLs discovery would process.
    Discover {
        /// Read priority entry URLs from this file (one per line).
        #[arg(long)]
        priority_file: Option<PathBuf>,
    },

    /// Publish the current snapshot without crawling.
    Publish {
        /// Publish even if the sink already has this snapshot.
        #[arg(long)]
        force: bool,
    },

    /// Show progress per entity, recent runs and recent skips.
    Status {
        /// Number of runs and skips to show.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags for `storysync run`. Each overrides the config file.
#[derive(clap::Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Stop starting new entities after this many.
    #[arg(long, env = "STORYSYNC_MAX_ENTITIES")]
    pub max_entities: Option<usize>,

    /// Stop starting new entities after this many seconds.
    #[arg(long, env = "STORYSYNC_DEADLINE_SECS")]
    pub deadline_secs: Option<u64>,

    /// Unit fetch worker pool size.
    #[arg(long, env = "STORYSYNC_WORKERS")]
    pub workers: Option<usize>,

    /// Entities processed in parallel.
    #[arg(long, env = "STORYSYNC_ENTITY_PARALLELISM")]
    pub entity_parallelism: Option<usize>,

    /// Read priority entry URLs from this file (one per line).
    #[arg(long)]
    pub priority_file: Option<PathBuf>,

    /// Only update the local snapshot.
    #[arg(long)]
    pub no_publish: bool,

    /// Publish even if the sink already has this snapshot.
    #[arg(long)]
    pub force_publish: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "storysync=info",
        1 => "storysync=debug",
        _ => "storysync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run(args) => cmd_run(config_path, args).await,
        Command::Discover { priority_file } => {
            cmd_discover(config_path, priority_file.as_deref()).await
        }
        Command::Publish { force } => cmd_publish(config_path, force).await,
        Command::Status { limit } => cmd_status(config_path, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Prepend entries from `--priority-file` to the configured ones.
fn apply_priority_file(config: &mut AppConfig, file: Option<&Path>) -> Result<()> {
    if let Some(file) = file {
        let mut entries = read_priority_file(file)?;
        entries.append(&mut config.source.priority_entries);
        config.source.priority_entries = entries;
    }
    Ok(())
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(n) = self.max_entities {
            config.run.max_entities_per_run = Some(n);
        }
        if let Some(secs) = self.deadline_secs {
            config.run.deadline_secs = Some(secs);
        }
        if let Some(w) = self.workers {
            config.fetch.workers = w;
        }
        if let Some(e) = self.entity_parallelism {
            config.fetch.entity_parallelism = e;
        }
        apply_priority_file(config, self.priority_file.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let mut app = load_app_config(config_path)?;
    args.apply(&mut app)?;

    // Everything that can be a config error is checked before any request.
    let sync = SyncConfig::from(&app);
    sync.validate()?;
    CompiledProfile::compile(&sync.profile)?;
    let sink = if args.no_publish {
        None
    } else {
        Some(build_sink(resolve_sink(&app.sink)?, sync.timeout)?)
    };

    let storage = Arc::new(Storage::open(&sync.state_db).await?);
    let publisher = sink.map(|sink| Publisher::new(sink, storage.clone()));

    let budget = RunBudget::new(sync.max_entities_per_run, sync.deadline);
    let stop = budget.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight entities");
            stop.store(true, Ordering::SeqCst);
        }
    });

    info!(
        snapshot = %sync.snapshot_path.display(),
        workers = sync.workers,
        entity_parallelism = sync.entity_parallelism,
        publish = publisher.is_some(),
        "starting run"
    );

    let reporter = CliProgress::new();
    let options = RunOptions {
        force_publish: args.force_publish,
    };
    let summary = run_sync(
        &sync,
        storage,
        publisher.as_ref(),
        &budget,
        &options,
        &reporter,
    )
    .await?;

    print_summary(&summary, &sync.snapshot_path);
    Ok(())
}

fn print_summary(summary: &RunSummary, snapshot_path: &Path) {
    println!();
    println!("  Run {}", summary.run_id);
    println!(
        "  Entries:   {} discovered, {} started",
        summary.entries_discovered, summary.entities_started
    );
    println!(
        "  Updated:   {} entities, {} units added",
        summary.entities_updated, summary.units_added
    );
    println!(
        "  Skipped:   {} entities, {} units failed, {} units empty",
        summary.entities_skipped, summary.units_failed, summary.units_empty
    );
    if let Some(reason) = &summary.stopped_early {
        println!("  Stopped:   {reason}");
    }
    let publish = match &summary.publish {
        PublishStatus::Disabled => "disabled".to_string(),
        PublishStatus::Published => "published".to_string(),
        PublishStatus::Unchanged => "unchanged, skipped".to_string(),
        PublishStatus::Failed(e) => format!("FAILED, will retry next run ({e})"),
    };
    println!("  Publish:   {publish}");
    println!("  Snapshot:  {}", snapshot_path.display());
    println!("  Time:      {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    println!();
}

async fn cmd_discover(config_path: Option<&Path>, priority_file: Option<&Path>) -> Result<()> {
    let mut app = load_app_config(config_path)?;
    apply_priority_file(&mut app, priority_file)?;

    let sync = SyncConfig::from(&app);
    sync.validate()?;
    let profile = Arc::new(CompiledProfile::compile(&sync.profile)?);
    let fetcher = PageFetcher::new(&sync)?;

    let discoverer = CatalogDiscoverer::new(fetcher, profile, DiscoveryOptions::from(&sync));
    let (entries, stats) = discoverer.discover().await?;

    for entry in &entries {
        println!("{}", entry.ref_url);
    }
    info!(
        entries = entries.len(),
        pages_fetched = stats.pages_fetched,
        pages_failed = stats.pages_failed,
        "discovery finished"
    );
    Ok(())
}

async fn cmd_publish(config_path: Option<&Path>, force: bool) -> Result<()> {
    let app = load_app_config(config_path)?;
    let sync = SyncConfig::from(&app);
    let sink = build_sink(resolve_sink(&app.sink)?, sync.timeout)?;

    let snapshot = Snapshot::load(&sync.snapshot_path)?;
    if snapshot.records.is_empty() {
        return Err(eyre!(
            "snapshot at '{}' is empty or missing; run `storysync run` first",
            sync.snapshot_path.display()
        ));
    }

    let storage = Arc::new(Storage::open(&sync.state_db).await?);
    let publisher = Publisher::new(sink, storage);
    match publisher.publish(&snapshot, force).await? {
        PublishOutcome::Published(report) => println!(
            "Published to {}: {} entities created, {} units sent{}",
            publisher.sink_name(),
            report.entities_created,
            report.units_added,
            if report.committed { ", new commit" } else { "" }
        ),
        PublishOutcome::Unchanged => println!(
            "Sink {} already has this snapshot (use --force to publish anyway)",
            publisher.sink_name()
        ),
    }
    Ok(())
}

async fn cmd_status(config_path: Option<&Path>, limit: u32) -> Result<()> {
    let app = load_app_config(config_path)?;
    let sync = SyncConfig::from(&app);
    if !sync.state_db.exists() {
        println!("No state database at {} yet.", sync.state_db.display());
        return Ok(());
    }
    let storage = Storage::open_readonly(&sync.state_db).await?;

    let progress = storage.list_progress().await?;
    println!("Progress ({} entities)", progress.len());
    for row in &progress {
        println!(
            "  {:<40} {:>6}  {:<20} {}",
            row.entity_id,
            row.last_ordinal,
            row.strategy.as_deref().unwrap_or("-"),
            row.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Recent runs");
    for run in storage.list_sync_runs(limit).await? {
        let finished = run
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unfinished".into());
        let stats = run
            .stats_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .map(|v| {
                format!(
                    "{} units added, {} entities skipped, publish {}",
                    v["units_added"], v["entities_skipped"], v["publish"]["status"]
                )
            })
            .unwrap_or_default();
        println!(
            "  {}  {} → {}  {stats}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M"),
            finished
        );
    }

    println!();
    println!("Recent skips");
    for skip in storage.list_skips(limit).await? {
        let ordinal = skip.ordinal.map(|o| format!("#{o}")).unwrap_or_default();
        println!(
            "  {} {}{ordinal} [{}] {}",
            skip.recorded_at.format("%Y-%m-%d %H:%M"),
            skip.entity_id,
            skip.kind,
            skip.message
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load_app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn entity_done(&self, report: &EntityReport, current: usize, total: usize) {
        let detail = match &report.skipped {
            Some(_) => "skipped".to_string(),
            None => format!("+{} units", report.units_added),
        };
        self.spinner
            .set_message(format!("[{current}/{total}] {} {detail}", report.entity_id));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
