use anyhow::{Context, Result};
use blackwall::clock::{Clock, SystemClock};
use blackwall::config::Config;
use blackwall::models::{EntryFilter, RunStatus};
use blackwall::orchestrator::{Orchestrator, SourceOutcome};
use chrono::DateTime;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blackwall-admin")]
#[command(about = "Blackwall collection and blacklist management CLI", long_about = None)]
struct Cli {
    /// Configuration file (defaults to BLACKWALL_CONFIG or ./blackwall.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run collection for sources that are due (or all of them with --force)
    Collect {
        /// Ignore collection intervals
        #[arg(long)]
        force: bool,
        /// Only run this source
        #[arg(long)]
        source: Option<String>,
    },
    /// Recompute active/expired status of every entry
    Expire,
    /// Show aggregate counts
    Stats {
        /// Limit the per-day breakdown to the last N days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Show the most recent collection runs
    Runs {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show per-source schedule and last run
    Intervals,
    /// Change a source's collection interval
    SetInterval {
        source: String,
        days: i64,
    },
    /// Show a single blacklist entry
    Lookup {
        ip: String,
    },
    /// List blacklist entries
    List {
        #[arg(long, value_enum, default_value_t = Filter::Active)]
        filter: Filter,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    All,
    Active,
    Expired,
}

impl From<Filter> for EntryFilter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::All => EntryFilter::All,
            Filter::Active => EntryFilter::Active,
            Filter::Expired => EntryFilter::Expired,
        }
    }
}

fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_opt_ts(ts: Option<i64>) -> String {
    ts.map(format_ts).unwrap_or_else(|| "-".to_string())
}

async fn collect(orchestrator: &Orchestrator, force: bool, source: Option<String>) -> Result<bool> {
    let reports = match source {
        Some(name) => vec![orchestrator.run_source(&name, force).await?],
        None if force => orchestrator.run_collection_now().await?.sources,
        None => orchestrator.run_collection_if_due().await?.sources,
    };

    let mut all_ok = true;
    for report in reports {
        match report.outcome {
            SourceOutcome::Skipped { reason } => {
                println!("- {:<20} skipped ({:?})", report.source, reason);
            }
            SourceOutcome::Ran { run, .. } => {
                let mark = match run.status {
                    RunStatus::Success => "✓",
                    RunStatus::Partial => "⚠",
                    RunStatus::Failed => {
                        all_ok = false;
                        "✗"
                    }
                };
                println!(
                    "{} {:<20} {:<8} records={} inserted={} updated={} rejected={}",
                    mark,
                    report.source,
                    run.status,
                    run.record_count,
                    run.inserted,
                    run.updated,
                    run.rejected
                );
                if let Some(summary) = run.error_summary {
                    println!("  {}", summary);
                }
            }
        }
    }

    Ok(all_ok)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = blackwall::bootstrap(&config, clock).await?;

    match cli.command {
        Commands::Collect { force, source } => {
            if !collect(&orchestrator, force, source).await? {
                std::process::exit(1);
            }
        }
        Commands::Expire => {
            let outcome = orchestrator.expiration().recompute_active_status().await?;
            println!(
                "✓ Expiration pass complete: {} activated, {} expired",
                outcome.activated, outcome.expired
            );
        }
        Commands::Stats { days } => {
            let snapshot = orchestrator.stats().snapshot(Some(days)).await?;
            println!(
                "Entries: {} total, {} active, {} expired",
                snapshot.summary.total, snapshot.summary.active, snapshot.summary.expired
            );
            for (title, buckets) in [
                ("By source", &snapshot.by_source),
                ("By country", &snapshot.by_country),
                ("By day", &snapshot.by_day),
            ] {
                println!();
                println!("{}:", title);
                for bucket in buckets {
                    println!("  {:<20} {}", bucket.dimension, bucket.count);
                }
            }
        }
        Commands::Runs { source, limit } => {
            let runs = orchestrator.recent_runs(source.as_deref(), limit).await?;
            if runs.is_empty() {
                println!("No collection runs recorded.");
            } else {
                println!(
                    "{:<6} {:<16} {:<20} {:<8} {:>8} {:>8} {:>8} {:>8}",
                    "ID", "Source", "Started", "Status", "Records", "Inserted", "Updated", "Rejected"
                );
                println!("{}", "-".repeat(92));
                for run in runs {
                    println!(
                        "{:<6} {:<16} {:<20} {:<8} {:>8} {:>8} {:>8} {:>8}",
                        run.id,
                        run.source,
                        format_ts(run.started_at),
                        run.status,
                        run.record_count,
                        run.inserted,
                        run.updated,
                        run.rejected
                    );
                    if let Some(summary) = run.error_summary {
                        println!("       {}", summary);
                    }
                }
            }
        }
        Commands::Intervals => {
            let statuses = orchestrator.status().await?;
            println!(
                "{:<16} {:<8} {:>8} {:<20} {:<20} {:<5} {}",
                "Source", "Enabled", "Days", "Last success", "Next due", "Due", "Last run"
            );
            println!("{}", "-".repeat(92));
            for status in statuses {
                let last_run = status
                    .last_run
                    .map(|run| format!("{} at {}", run.status, format_ts(run.finished_at)))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<16} {:<8} {:>8} {:<20} {:<20} {:<5} {}",
                    status.source,
                    status.enabled,
                    status.interval_days,
                    format_opt_ts(status.last_success_at),
                    format_opt_ts(status.next_due_at),
                    status.due,
                    last_run
                );
            }
        }
        Commands::SetInterval { source, days } => {
            let updated = orchestrator.update_interval(&source, days).await?;
            println!(
                "✓ Source '{}' now collects every {} days",
                updated.source, updated.interval_days
            );
        }
        Commands::Lookup { ip } => match orchestrator.store().get_entry(&ip).await? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => println!("⚠ {} is not on the blacklist", ip),
        },
        Commands::List {
            filter,
            limit,
            offset,
        } => {
            let entries = orchestrator
                .store()
                .list_entries(filter.into(), limit, offset)
                .await?;
            println!(
                "{:<16} {:<7} {:<20} {:<20} {:<8} {}",
                "IP", "Active", "Detected", "Expires", "Country", "Sources"
            );
            println!("{}", "-".repeat(92));
            for entry in entries {
                println!(
                    "{:<16} {:<7} {:<20} {:<20} {:<8} {}",
                    entry.ip,
                    entry.is_active,
                    format_ts(entry.detection_date),
                    format_ts(entry.expires_at),
                    entry.country.as_deref().unwrap_or("-"),
                    entry.sources.join(",")
                );
            }
        }
    }

    Ok(())
}
