use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rasp_harvest::{BrowserlessBrowser, BrowserlessConfig};
use rasp_store::Ledger;
use rasp_sync::{run_scheduler, HarvestPipeline, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "rasp-cli")]
#[command(about = "Reel acquisition and sync pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the tick scheduler until interrupted.
    Run,
    /// Execute a single harvesting cycle and exit.
    Cycle,
    /// Execute a single camouflage cycle and exit.
    Camouflage,
    /// Print a summary of the ledger contents.
    Ledger,
}

fn build_pipeline(config: &PipelineConfig) -> Result<HarvestPipeline> {
    let browser = BrowserlessBrowser::new(BrowserlessConfig {
        base_url: config.browserless_url.clone(),
        token: config.browserless_token.clone(),
        ..BrowserlessConfig::default()
    })?;
    HarvestPipeline::new(config.clone(), Box::new(browser))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rasp=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = Arc::new(build_pipeline(&config)?);
            let thresholds = config.thresholds;
            run_scheduler(pipeline, thresholds, &config.tick_cron).await?;
        }
        Commands::Cycle => {
            let pipeline = build_pipeline(&config)?;
            let summary = pipeline.run_cycle().await?;
            println!(
                "cycle complete: id={} usernames={} profiles={} links={} downloads={}/{} skipped={} converted={} profile_puts={} content_puts={} took={}s",
                summary.cycle_id,
                summary.usernames,
                summary.profiles_harvested,
                summary.links_queued,
                summary.downloads_completed,
                summary.downloads_completed + summary.downloads_failed,
                summary.downloads_skipped,
                summary.conversion.converted,
                summary.profile_puts,
                summary.content_puts,
                (summary.finished_at - summary.started_at).num_seconds(),
            );
        }
        Commands::Camouflage => {
            let pipeline = build_pipeline(&config)?;
            pipeline.run_camouflage().await?;
            info!("camouflage cycle complete");
        }
        Commands::Ledger => {
            let ledger = Ledger::new(config.ledger_path.clone());
            let records = ledger.load().await;
            let downloaded = records.iter().filter(|r| r.downloaded).count();
            let converted = records.iter().filter(|r| r.is_converted).count();
            let synced = records.iter().filter(|r| r.server_mp4_url.is_some()).count();
            println!(
                "ledger {}: records={} downloaded={} converted={} uploaded={}",
                config.ledger_path.display(),
                records.len(),
                downloaded,
                converted,
                synced,
            );
        }
    }

    Ok(())
}
