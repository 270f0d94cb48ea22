use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use statreg_sync::{HarvestConfig, Harvester, HarvestRunSummary, PIPELINES};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "statreg-cli")]
#[command(about = "Harvests government statistics catalogs into a local registry")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run pipelines once; all of them when none are named.
    Harvest {
        pipelines: Vec<String>,
    },
    /// Create every pipeline's tables.
    Schema,
    /// List the compiled-in pipelines.
    Pipelines,
    /// Run all pipelines on HARVEST_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest { pipelines: Vec::new() }) {
        Commands::Harvest { pipelines } => {
            let summaries = statreg_sync::run_pipelines_from_env(&pipelines).await?;
            for summary in &summaries {
                print_summary(summary)?;
            }
        }
        Commands::Schema => {
            let harvester = Harvester::connect(HarvestConfig::from_env()).await?;
            harvester.ensure_schemas(&PIPELINES).await?;
            harvester.close().await;
            println!("schema ready for {} pipelines", PIPELINES.len());
        }
        Commands::Pipelines => {
            for spec in PIPELINES {
                println!(
                    "{:<18} source={:<10} prefix={:<7} policy={:?} shape={:?}",
                    spec.name,
                    spec.source.source_id(),
                    spec.table_prefix,
                    spec.policy,
                    spec.shape
                );
            }
        }
        Commands::Schedule => {
            let harvester = Arc::new(Harvester::connect(HarvestConfig::from_env()).await?);
            let Some(mut sched) = Arc::clone(&harvester).maybe_build_scheduler().await? else {
                warn!("scheduler disabled; set HARVEST_SCHEDULER_ENABLED=true to enable it");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron = %harvester.config().harvest_cron,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            harvester.close().await;
        }
    }

    Ok(())
}

fn print_summary(summary: &HarvestRunSummary) -> Result<()> {
    println!(
        "harvest complete: pipeline={} run_id={} pages={} created={} updated={} unchanged={} \
         skipped={}",
        summary.pipeline,
        summary.run_id,
        summary.pages_fetched,
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.items_skipped
    );
    let json = serde_json::to_string(summary).context("serializing run summary")?;
    info!(summary = %json, "run summary");
    Ok(())
}
