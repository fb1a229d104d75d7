//! Shift Report CLI
//!
//! Scheduled production reports from plant time-series data.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shift_report::{
    config::Config,
    core::{schedule::format_duration, Clock, RunLoop, ScheduleState, SystemClock},
    influx::BlockingInfluxClient,
    notify::{EmailNotifier, NoopNotifier, Notifier},
    pipeline::{PipelineError, PipelineSettings, ReportPipeline, RunOutcome},
    sink::CsvSink,
    stats::{create_shared_log_with_persistence, load_stats},
    VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "shift-report")]
#[command(version = VERSION)]
#[command(about = "Scheduled shift reports from production time-series data", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run reports on the configured schedule until interrupted
    Start,

    /// Run a single report for the window ending now
    Once,

    /// Show upcoming fire times
    Next {
        /// Number of fire times to show
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,
    },

    /// Show cumulative run statistics
    Status,

    /// Show configuration
    Config,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check connectivity to the time-series store
    Check,
}

type Pipeline = ReportPipeline<BlockingInfluxClient, CsvSink, Box<dyn Notifier>>;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Start => cmd_start(config_path),
        Commands::Once => cmd_once(config_path),
        Commands::Next { count } => cmd_next(config_path, count),
        Commands::Status => cmd_status(config_path),
        Commands::Config => cmd_config(config_path),
        Commands::Init { force } => cmd_init(config_path, force),
        Commands::Check => cmd_check(config_path),
    }
}

/// Load configuration and install the log subscriber.
fn load(config_path: Option<&Path>) -> anyhow::Result<Config> {
    let config = Config::load(config_path).context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging)),
        )
        .init();

    Ok(config)
}

fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    config
        .ensure_directories()
        .context("could not create output directories")?;

    let fetcher = BlockingInfluxClient::new(config.source.clone())
        .context("invalid time-series store configuration")?;
    let sink = CsvSink::new(&config.report.output_dir);

    let notifier: Box<dyn Notifier> = if config.email.notifications_enabled() {
        Box::new(
            EmailNotifier::from_config(
                &config.email.smtp,
                config.email.from.as_deref(),
                &config.email.recipients(),
            )
            .context("invalid email configuration")?,
        )
    } else {
        Box::new(NoopNotifier)
    };

    let settings = PipelineSettings::from_config(config)?;
    Ok(ReportPipeline::new(fetcher, sink, notifier, settings))
}

fn print_outcome(outcome: &RunOutcome) {
    println!(
        "[{}] Run {} complete: {} readings, {} state changes",
        Utc::now().format("%H:%M:%S"),
        outcome.run_id,
        outcome.readings,
        outcome.state_changes
    );
    for location in &outcome.locations {
        println!("  wrote {}", location.display());
    }
    if outcome.notified {
        println!("  notification sent");
    }
}

fn cmd_start(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path)?;

    println!("Shift Report v{VERSION}");
    println!();
    println!("  Source: {} (bucket {})", config.source.url, config.source.bucket);
    println!("  Anchor: {}", config.report.time.format("%H:%M:%S"));
    println!("  Interval: {}", format_duration(config.report.interval));
    println!("  Window: {}", format_duration(config.report.window));
    println!("  Output: {}", config.report.output_dir.display());
    println!(
        "  Email: {}",
        if config.email.notifications_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let run_log = create_shared_log_with_persistence(config.stats_path());
    let pipeline = build_pipeline(&config)?.with_run_log(run_log.clone());

    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc_handler(shutdown.clone())?;

    let mut run_loop = RunLoop::new(SystemClock, config.report.time, config.report.interval)?
        .with_shutdown(shutdown);

    println!("  First run: {}", run_loop.schedule().next_fire);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let result = run_loop.run(|fire_time| {
        tracing::debug!(%fire_time, "fire due");
        let outcome = pipeline.run(Utc::now())?;
        print_outcome(&outcome);
        if let Err(e) = run_log.save() {
            tracing::warn!(error = %e, "could not save run statistics");
        }
        Ok::<(), PipelineError>(())
    });

    if let Err(e) = run_log.save() {
        eprintln!("Warning: Could not save run statistics: {e}");
    }

    println!();
    println!("{}", run_log.summary());

    result.context("scheduled run failed")
}

fn cmd_once(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path)?;

    let run_log = create_shared_log_with_persistence(config.stats_path());
    let pipeline = build_pipeline(&config)?.with_run_log(run_log.clone());

    let result = pipeline.run(Utc::now());
    if let Err(e) = run_log.save() {
        eprintln!("Warning: Could not save run statistics: {e}");
    }

    print_outcome(&result.context("report run failed")?);
    Ok(())
}

fn cmd_next(config_path: Option<&Path>, count: usize) -> anyhow::Result<()> {
    let config = load(config_path)?;

    let now = SystemClock.now();
    let schedule = ScheduleState::new(now, config.report.time, config.report.interval)?;

    println!("Now: {now}");
    for (i, fire) in schedule.upcoming(count).iter().enumerate() {
        println!("  {:>3}. {fire}", i + 1);
    }
    Ok(())
}

fn cmd_status(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path)?;

    println!("Shift Report Status");
    println!("===================");
    println!();

    let stats_path = config.stats_path();
    if !stats_path.exists() {
        println!("No previous run data found.");
        return Ok(());
    }

    let stats = load_stats(&stats_path)
        .with_context(|| format!("could not read {}", stats_path.display()))?;

    println!("Cumulative Statistics:");
    println!("  Fires completed: {}", stats.fires);
    println!("  Fires failed: {}", stats.failed_fires);
    println!("  Readings aligned: {}", stats.readings_aligned);
    println!("  Reports published: {}", stats.reports_published);
    println!("  Notifications sent: {}", stats.notifications_sent);
    match stats.last_fire {
        Some(t) => println!("  Last fire: {}", t.to_rfc3339()),
        None => println!("  Last fire: never"),
    }
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!(
        "Config file: {:?}",
        config_path.map(Path::to_path_buf).unwrap_or_else(Config::config_path)
    );
    println!();
    println!(
        "{}",
        toml::to_string_pretty(&config).context("could not render configuration")?
    );
    Ok(())
}

fn cmd_init(config_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_path);

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default()
        .save(&path)
        .with_context(|| format!("could not write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn cmd_check(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path)?;

    let client = BlockingInfluxClient::new(config.source.clone())
        .context("invalid time-series store configuration")?;

    match client.test_connection() {
        Ok(true) => {
            println!("Connection to {}: OK", config.source.url);
            Ok(())
        }
        Ok(false) => bail!("{} reported unhealthy", config.source.url),
        Err(e) => Err(e).context(format!("could not connect to {}", config.source.url)),
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
