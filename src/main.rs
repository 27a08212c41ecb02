use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use vigil::config::PipelineConfig;
use vigil::db::Database;
use vigil::logging::configure_logging;
use vigil::pipeline::Pipeline;
use vigil::TARGET_PIPELINE;

#[derive(Parser)]
#[command(name = "vigil", about = "News candidate selection and deduplication pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new pipeline run.
    Run {
        /// Dedup mode: strict, standard or lenient. Defaults to DEDUP_MODE.
        #[arg(long)]
        mode: Option<String>,
    },
    /// Run an on-demand cross-run dedup pass for one day.
    Dedup {
        /// Day to deduplicate as YYYY-MM-DD. Defaults to today.
        #[arg(long)]
        day: Option<String>,
    },
    /// Show a run and its per-step progress.
    Status { run_id: String },
    /// Resume a paused run at its earliest unfinished step.
    Resume { run_id: String },
    /// Delete signatures, decisions and runs past their retention windows.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();
    let cli = Cli::parse();

    let config = PipelineConfig::from_env()?;
    let db = Database::new(&config.database_path)
        .await
        .context("failed to open the state store")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            error!(target: TARGET_PIPELINE, "Failed to listen for ctrl-c");
        }
        info!(target: TARGET_PIPELINE, "Shutdown requested, pausing at the next safe point");
        let _ = cancel_tx.send(true);
    });

    match cli.command {
        Command::Run { mode } => {
            let mode = mode.unwrap_or_else(|| config.mode.as_str().to_string());
            let pipeline = Pipeline::new(db, config, cancel_rx);
            let run_id = pipeline.start(&mode).await?;
            println!("run {}", run_id);
            if let Some(report) = pipeline.run_status(&run_id).await? {
                print_report(&report);
            }
        }
        Command::Dedup { day } => {
            let day = match day {
                Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .with_context(|| format!("invalid day '{}', expected YYYY-MM-DD", raw))?,
                None => Utc::now().date_naive(),
            };
            let pipeline = Pipeline::new(db, config, cancel_rx);
            let report = pipeline.trigger_dedup(day).await?;
            println!(
                "processed {} items: {} duplicates, {} unique ({} errored), duplicate rate {:.1}%",
                report.processed,
                report.duplicates,
                report.unique,
                report.errored,
                report.duplicate_rate * 100.0
            );
        }
        Command::Status { run_id } => {
            let pipeline = Pipeline::new(db, config, cancel_rx);
            match pipeline.run_status(&run_id).await? {
                Some(report) => print_report(&report),
                None => println!("no run '{}'", run_id),
            }
        }
        Command::Resume { run_id } => {
            let pipeline = Pipeline::new(db, config, cancel_rx);
            pipeline.resume(&run_id).await?;
            if let Some(report) = pipeline.run_status(&run_id).await? {
                print_report(&report);
            }
        }
        Command::Cleanup => {
            let signatures = db.cleanup_signatures(config.signature_retention_days).await?;
            let decisions = db.cleanup_decisions(config.run_retention_days).await?;
            let runs = db.cleanup_runs(config.run_retention_days).await?;
            println!(
                "removed {} signatures, {} decisions, {} runs",
                signatures, decisions, runs
            );
        }
    }

    Ok(())
}

fn print_report(report: &vigil::pipeline::RunReport) {
    println!(
        "run {} [{}] status: {}",
        report.run.id,
        report.run.mode,
        report.run.status.as_str()
    );
    if let Some(error) = &report.run.error {
        println!("  error: {}", error);
    }
    for step in &report.steps {
        println!(
            "  {:<14} {:<9} processed {} (ok {}, failed {}){}",
            step.step.as_str(),
            step.status.as_str(),
            step.processed,
            step.succeeded,
            step.failed,
            step.error
                .as_deref()
                .map(|e| format!(" error: {}", e))
                .unwrap_or_default()
        );
    }
}
