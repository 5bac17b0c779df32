use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_sync::{RunMode, RunOutcome, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Reconcile a team directory into a roster sink")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and apply changes to the sink.
    Sync,
    /// Compute the change plan without writing to the sink.
    Plan,
    /// Create the Postgres sink schema.
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "roster_cli=info,roster_sync=info,roster_adapters=info,roster_avatar=info,roster_storage=info",
        1 => "roster_cli=debug,roster_sync=debug,roster_adapters=debug,roster_avatar=debug,roster_storage=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with_target(verbose >= 2)
        .init();
}

fn print_outcome(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    println!(
        "{} complete: run_id={} source={} entries={} desired={} excluded={}",
        summary.mode,
        summary.run_id,
        summary.source_id,
        summary.source_entries,
        summary.desired,
        summary.excluded
    );
    match &summary.result {
        Some(result) => {
            println!(
                "created={} updated={} deleted={} errors={}",
                result.created,
                result.updated,
                result.deleted,
                result.errors.len()
            );
            for err in &result.errors {
                println!("  {} {}: {}", err.operation, err.identity, err.message);
            }
        }
        None => {
            for record in &outcome.plan.to_create {
                println!("  create {}", record.identity);
            }
            for (key, _) in &outcome.plan.to_update {
                println!("  update {key}");
            }
            for key in &outcome.plan.to_delete {
                println!("  delete {key}");
            }
        }
    }
    for excluded in &outcome.exclusions {
        println!(
            "  excluded {} ({})",
            excluded
                .identity
                .as_deref()
                .or(excluded.display_name.as_deref())
                .unwrap_or("<unnamed>"),
            excluded.reason
        );
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports={dir}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SyncConfig::from_env()?;
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            print_outcome(&pipeline.run_once(RunMode::Apply).await?);
        }
        Commands::Plan => {
            let pipeline = SyncPipeline::from_config(config).await?;
            print_outcome(&pipeline.run_once(RunMode::PlanOnly).await?);
        }
        Commands::Migrate => {
            roster_sync::migrate(&config).await?;
            println!("roster schema ready");
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "roster scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
