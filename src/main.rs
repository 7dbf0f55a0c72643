use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use render_queue::config::{AppConfig, StorageConfig};
use render_queue::estimator::BatchEta;
use render_queue::runtime::{BatchOutcome, Runtime};
use render_queue::scheduler::{Job, JobId, MoveDirection, SchedulerEvent, SchedulerHandle};
use render_queue::shutdown::install_shutdown_handler;
use render_queue::store::{LifetimeStats, SettingsStore};

#[derive(Parser, Debug)]
#[command(name = "render-queue")]
#[command(version)]
#[command(about = "A sequential render queue for Blender scenes")]
#[command(propagate_version = true)]
struct Args {
    /// Directory holding the queue, render history, statistics and settings
    #[arg(
        long,
        global = true,
        env = "RENDER_QUEUE_DATA_DIR",
        default_value = ".render-queue"
    )]
    data_dir: PathBuf,

    /// Render engine executable (overrides the saved setting)
    #[arg(long, global = true, env = "RENDER_QUEUE_ENGINE")]
    engine: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Add scene files to the end of the queue
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Remove jobs by id or path
    Remove {
        #[arg(required_unless_present = "all")]
        jobs: Vec<String>,

        /// Remove every job that is not rendering
        #[arg(long, conflicts_with = "jobs")]
        all: bool,
    },

    /// Show the queue
    List {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Put a job back to Ready with a fresh attempt count
    Reset { job: String },

    /// Reset every job that is not rendering
    ResetAll,

    /// Re-queue every finished job
    ClearDone,

    /// Move a job one slot up or down
    Move { job: String, direction: Direction },

    /// Render the queue headlessly until it drains
    Run(RunArgs),

    /// Serve the HTTP control API
    Serve {
        /// Port to listen on
        #[arg(long, env = "RENDER_QUEUE_PORT", default_value = "8080")]
        port: u16,

        /// Re-queue failed jobs at the tail instead of skipping them
        #[arg(long, env = "RENDER_QUEUE_AUTO_RETRY")]
        auto_retry: bool,
    },

    /// Lifetime render statistics
    Stats {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Estimated time to finish the queue
    Eta {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Saved settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Re-queue failed jobs at the tail instead of skipping them
    #[arg(long, env = "RENDER_QUEUE_AUTO_RETRY")]
    auto_retry: bool,

    /// Render only the first frame of each scene
    #[arg(long)]
    single_frame: bool,

    /// Output directory for single-frame renders
    #[arg(long, requires = "single_frame")]
    output_dir: Option<PathBuf>,

    /// Hide render engine output
    #[arg(long, short = 'q')]
    quiet: bool,
}

#[derive(clap::Subcommand, Debug)]
enum SettingsCommands {
    /// Print the saved settings
    Show,
    /// Change saved settings
    Set {
        /// Render engine executable
        #[arg(long)]
        executable: Option<PathBuf>,

        /// Render only the first frame by default
        #[arg(long)]
        single_frame: Option<bool>,

        /// Output directory for single-frame renders
        #[arg(long, conflicts_with = "clear_output_dir")]
        output_dir: Option<PathBuf>,

        /// Go back to the engine's own output location
        #[arg(long)]
        clear_output_dir: bool,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Direction {
    Up,
    Down,
}

impl From<Direction> for MoveDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Up => MoveDirection::Up,
            Direction::Down => MoveDirection::Down,
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListItem {
    id: String,
    name: String,
    path: String,
    status: String,
    attempts: u32,
    last_duration_secs: Option<f64>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: usize,
}

impl From<&Job> for JobListItem {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.display_name(),
            path: job.path.display().to_string(),
            status: job.status.to_string(),
            attempts: job.attempts,
            last_duration_secs: job.last_duration.map(|d| d.as_secs_f64()),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn format_seconds(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn app_config(args: &Args) -> AppConfig {
    let storage = StorageConfig::new(&args.data_dir);
    let settings = SettingsStore::new(storage.settings_path()).load();
    let mut config = AppConfig::new(storage).with_settings(&settings);
    if let Some(engine) = &args.engine {
        config.engine.executable = engine.clone();
    }
    config
}

async fn resolve(
    handle: &SchedulerHandle,
    reference: &str,
) -> Result<JobId, Box<dyn std::error::Error>> {
    Ok(handle.resolve(reference).await?)
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_add(
    handle: &SchedulerHandle,
    files: Vec<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rejected = 0;
    for file in files {
        match handle.add_job(&file).await {
            Ok(job) => println!("Queued {} ({})", job.display_name(), job.id),
            Err(e) => {
                rejected += 1;
                eprintln!("Skipped {}: {}", file.display(), e);
            }
        }
    }
    if rejected > 0 {
        return Err(format!("{} file(s) were not queued", rejected).into());
    }
    Ok(())
}

async fn handle_remove(
    handle: &SchedulerHandle,
    references: Vec<String>,
    all: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if all {
        let removed = handle.remove_all().await?;
        println!("Removed {} job(s)", removed);
        return Ok(());
    }

    let mut ids = Vec::with_capacity(references.len());
    for reference in &references {
        ids.push(resolve(handle, reference).await?);
    }
    for job in handle.remove_jobs(ids).await? {
        println!("Removed {}", job.display_name());
    }
    Ok(())
}

async fn handle_list(
    handle: &SchedulerHandle,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = handle.jobs().await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: jobs.len(),
                jobs: jobs.iter().map(JobListItem::from).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            println!(
                "{:<4} {:<30} {:<10} {:<12} {:<10} ID",
                "#", "NAME", "STATUS", "ATTEMPTS", "LAST"
            );
            println!("{}", "-".repeat(106));
            for (index, job) in jobs.iter().enumerate() {
                let mut name = job.display_name();
                if name.chars().count() > 28 {
                    name = format!("{}...", name.chars().take(25).collect::<String>());
                }
                let last = job
                    .last_duration
                    .map(|d| format_seconds(d.as_secs_f64()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<4} {:<30} {:<10} {:<12} {:<10} {}",
                    index + 1,
                    name,
                    job.status,
                    job.attempt_label().unwrap_or_default(),
                    last,
                    job.id
                );
            }
            println!();
            println!("{} job(s)", jobs.len());
        }
    }

    Ok(())
}

async fn handle_run(runtime: &Runtime, quiet: bool) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let names: std::collections::HashMap<JobId, String> = runtime
        .handle
        .jobs()
        .await?
        .iter()
        .map(|job| (job.id, job.display_name()))
        .collect();
    let name_of = |id: &JobId| names.get(id).cloned().unwrap_or_else(|| id.to_string());

    let outcome = runtime
        .run_batch(shutdown, |event| match event {
            SchedulerEvent::JobStarted { job_id, attempt, .. } => {
                println!("==> Rendering {} (attempt {})", name_of(job_id), attempt);
            }
            SchedulerEvent::JobOutput { line, .. } => {
                if !quiet {
                    println!("    {}", line);
                }
            }
            SchedulerEvent::JobFinished {
                job_id,
                status,
                duration,
                ..
            } => {
                println!(
                    "==> {} {} after {}",
                    name_of(job_id),
                    status,
                    format_seconds(duration.as_secs_f64())
                );
            }
            SchedulerEvent::BatchCompleted { .. } | SchedulerEvent::BatchHalted { .. } => {}
        })
        .await?;

    let (label, summary) = match outcome {
        BatchOutcome::Completed(summary) => ("Batch complete", summary),
        BatchOutcome::Halted(summary) => ("Batch cancelled", summary),
    };
    println!();
    println!(
        "{}: {} rendered, {} failed, {} cancelled in {}",
        label,
        summary.succeeded,
        summary.failed,
        summary.canceled,
        format_seconds(summary.elapsed.as_secs_f64())
    );
    Ok(())
}

fn print_stats(
    stats: &LifetimeStats,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(stats)?),
        OutputFormat::Table => {
            println!("Render Statistics");
            println!("{}", "=".repeat(40));
            println!("Successful renders: {}", stats.success_count);
            println!("Failed renders:     {}", stats.error_count);
            println!("Attempts:           {}", stats.attempt_count);
            println!("Render time:        {}", format_seconds(stats.total_seconds));
            if let Some(rate) = stats.success_rate() {
                println!("Success rate:       {:.1}%", rate * 100.0);
            }
            if !stats.recent_log.is_empty() {
                println!();
                println!(
                    "{:<20} {:<10} {:<8} {:<10} NAME",
                    "TIME", "OUTCOME", "ATTEMPT", "DURATION"
                );
                println!("{}", "-".repeat(70));
                for entry in stats.recent_log.iter().rev() {
                    println!(
                        "{:<20} {:<10} {:<8} {:<10} {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                        entry.outcome,
                        entry.attempt_number,
                        format_seconds(entry.duration_seconds),
                        entry.name
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_eta(
    eta: &BatchEta,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(eta)?),
        OutputFormat::Table => {
            if eta.pending_jobs() == 0 {
                println!("Nothing left to render.");
                return Ok(());
            }
            let prefix = if eta.is_complete() { "" } else { "at least " };
            println!("Remaining: {}{}", prefix, format_seconds(eta.total_seconds));
            println!(
                "Jobs: {} from history, {} inferred, {} unknown",
                eta.estimated_jobs, eta.inferred_jobs, eta.unknown_jobs
            );
        }
    }
    Ok(())
}

fn handle_settings(
    args: &Args,
    command: &SettingsCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = SettingsStore::new(StorageConfig::new(&args.data_dir).settings_path());
    let mut settings = store.load();

    if let SettingsCommands::Set {
        executable,
        single_frame,
        output_dir,
        clear_output_dir,
    } = command
    {
        if let Some(executable) = executable {
            settings.executable_path = executable.clone();
        }
        if let Some(single_frame) = single_frame {
            settings.single_frame_mode = *single_frame;
        }
        if let Some(output_dir) = output_dir {
            settings.output_dir = Some(output_dir.clone());
        }
        if *clear_output_dir {
            settings.output_dir = None;
        }
        store.save(&settings)?;
    }

    println!("Engine:       {}", settings.executable_path.display());
    println!("Single frame: {}", settings.single_frame_mode);
    println!(
        "Output dir:   {}",
        settings
            .output_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "(engine default)".to_string())
    );
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Settings { command } = &args.command {
        return handle_settings(&args, command);
    }

    let mut config = app_config(&args);
    match &args.command {
        Commands::Run(run) => {
            config = config.with_auto_retry(run.auto_retry);
            if run.single_frame {
                config.scheduler.single_frame = true;
                if run.output_dir.is_some() {
                    config.scheduler.output_dir = run.output_dir.clone();
                }
            }
        }
        Commands::Serve { auto_retry, .. } => config = config.with_auto_retry(*auto_retry),
        _ => {}
    }

    let runtime = Runtime::start(config);
    let handle = &runtime.handle;

    match args.command {
        Commands::Add { files } => handle_add(handle, files).await?,
        Commands::Remove { jobs, all } => handle_remove(handle, jobs, all).await?,
        Commands::List { output } => handle_list(handle, &output).await?,
        Commands::Reset { job } => {
            let id = resolve(handle, &job).await?;
            let job = handle.reset_job(id).await?;
            println!("Reset {}", job.display_name());
        }
        Commands::ResetAll => {
            let count = handle.reset_all().await?;
            println!("Reset {} job(s)", count);
        }
        Commands::ClearDone => {
            let count = handle.clear_done().await?;
            println!("Re-queued {} finished job(s)", count);
        }
        Commands::Move { job, direction } => {
            let id = resolve(handle, &job).await?;
            handle.move_job(id, direction.into()).await?;
        }
        Commands::Run(run) => handle_run(&runtime, run.quiet).await?,
        Commands::Serve { port, .. } => {
            let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
            let shutdown = install_shutdown_handler();
            runtime.serve(addr, shutdown).await?;
        }
        Commands::Stats { output } => print_stats(&handle.stats().await?, &output)?,
        Commands::Eta { output } => print_eta(&handle.eta().await?, &output)?,
        Commands::Settings { .. } => {}
    }

    Ok(())
}
