//! `cohort` command-line runner
//!
//! Splits daily candidate files into TEST and CONTROL sets against the
//! store, log and publish directory named in an engine config file.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use cohort_engine::{
    AudienceLog, AudienceRun, DayBatch, DayOutcome, DirectorySink, EngineConfig, JsonlAudienceLog, SplitEngine,
    UploadStatus,
};
use cohort_store::{AffinityStore, AudienceName, FileAffinityStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod input;

#[derive(Parser)]
#[command(name = "cohort", about = "Stratified TEST/CONTROL audience splits with durable affinity")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config file
    #[arg(short, long, global = true, default_value = "cohort.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Split one day of one audience from a candidate file
    Split {
        /// Audience name
        #[arg(short, long)]
        audience: String,

        /// Day being split (YYYY-MM-DD)
        #[arg(short, long)]
        day: NaiveDate,

        /// JSON-lines candidate file
        #[arg(long)]
        candidates: PathBuf,
    },
    /// Run every configured audience over `<input>/<audience>/<YYYY-MM-DD>.jsonl`
    Run {
        /// Directory of candidate files
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Print an audience's stored assignments
    Show {
        /// Audience name
        #[arg(short, long)]
        audience: String,
    },
    /// Print an audience's log entries
    History {
        /// Audience name
        #[arg(short, long)]
        audience: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = EngineConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Commands::Split {
            audience,
            day,
            candidates,
        } => split(&config, &audience, day, &candidates).await,
        Commands::Run { input } => run(&config, &input).await,
        Commands::Show { audience } => show(&config, &audience).await,
        Commands::History { audience } => history(&config, &audience).await,
    }
}

/// `RUST_LOG` overrides the default `info` level
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn open_engine(config: &EngineConfig) -> Result<Arc<SplitEngine>> {
    let store = FileAffinityStore::open(&config.store_dir)
        .await
        .with_context(|| format!("opening store {}", config.store_dir.display()))?;
    Ok(Arc::new(SplitEngine::new(
        Arc::new(store),
        Arc::new(JsonlAudienceLog::new(&config.log_path)),
        Arc::new(DirectorySink::new(&config.publish_dir)),
        config.settings(),
    )))
}

async fn split(config: &EngineConfig, audience: &str, day: NaiveDate, candidates: &Path) -> Result<()> {
    let audience_config = config
        .audience(audience)
        .with_context(|| format!("audience {audience} is not configured"))?;
    let candidates = input::read_candidates(candidates).await?;

    let engine = open_engine(config).await?;
    let outcome = engine
        .run_day(audience_config, DayBatch::new(day, candidates))
        .await
        .with_context(|| format!("splitting {audience} for {day}"))?;
    print_outcome(&outcome);
    Ok(())
}

async fn run(config: &EngineConfig, input: &Path) -> Result<()> {
    let mut runs = Vec::with_capacity(config.audiences.len());
    for audience in &config.audiences {
        let batches = if audience.mode.is_enabled() {
            input::read_batches(input, &audience.name).await?
        } else {
            Vec::new()
        };
        runs.push(AudienceRun::new(audience.clone(), batches));
    }

    let days: usize = runs.iter().map(|r| r.batches.len()).sum();
    tracing::info!(audiences = runs.len(), days, "running configured audiences");
    let engine = open_engine(config).await?;
    let reports = engine.run_all(runs).await;

    let mut failed = 0usize;
    for report in &reports {
        if report.skipped {
            println!("{}: off", report.audience);
            continue;
        }
        if !report.already_committed.is_empty() {
            println!(
                "{}: {} day(s) already committed, skipped",
                report.audience,
                report.already_committed.len()
            );
        }
        for outcome in &report.outcomes {
            print_outcome(outcome);
        }
        if let Some(e) = &report.error {
            failed += 1;
            println!("{}: failed: {e}", report.audience);
        }
    }
    if failed > 0 {
        bail!("{failed} of {} audiences failed", reports.len());
    }
    Ok(())
}

async fn show(config: &EngineConfig, audience: &str) -> Result<()> {
    let name = AudienceName::new(audience)?;
    let store = FileAffinityStore::open(&config.store_dir).await?;
    let snapshot = store
        .read(&name)
        .await
        .with_context(|| format!("reading store for {audience}"))?;

    let live = snapshot.live_counts();
    println!(
        "{audience}: last day {}, live test {} control {}, ever test {} control {}",
        snapshot
            .last_committed_day
            .map_or_else(|| "none".to_string(), |d| d.to_string()),
        live.test,
        live.control,
        snapshot.totals.test,
        snapshot.totals.control,
    );
    for record in snapshot.records.values() {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

async fn history(config: &EngineConfig, audience: &str) -> Result<()> {
    let log = JsonlAudienceLog::new(&config.log_path);
    let entries = log
        .history(audience)
        .await
        .with_context(|| format!("reading {}", config.log_path.display()))?;
    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn print_outcome(outcome: &DayOutcome) {
    let result = &outcome.result;
    let upload = match &outcome.handoff.upload {
        UploadStatus::Published { users } => format!("published {users}"),
        UploadStatus::Skipped => "not published".to_string(),
        UploadStatus::Failed(reason) => format!("publish failed: {reason}"),
    };
    println!(
        "{} {} [{}]: test {} control {} (new {}/{}, retained {}, dropped {}), {upload}",
        outcome.audience,
        result.day,
        outcome.mode,
        result.test_user_count(),
        result.control_user_count(),
        result.new_test_count,
        result.new_control_count,
        outcome.retained_count,
        outcome.dropped_count,
    );
}
