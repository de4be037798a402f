use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use transit_sync::{StoreKind, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "transit-cli")]
#[command(about = "Transit station reconciliation command-line interface")]
struct Cli {
    /// Serve all three sources from JSON fixtures in this directory.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    /// Keep stations in memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full reconciliation once.
    Sync,
    /// Geocode stations that are still missing coordinates.
    Supplement,
    /// Start the HTTP control surface.
    Serve,
    /// Apply SQL migrations.
    Migrate,
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(dir) = &self.fixtures {
            config = config.with_fixtures(dir);
        }
        if self.memory {
            config.store = StoreKind::Memory;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    let command = cli.command.unwrap_or(Commands::Sync);
    info!(?command, store = ?config.store, fixtures = ?config.fixtures_dir, "transit-cli starting");

    match command {
        Commands::Sync => {
            let summary = transit_sync::run_sync_once(config).await?;
            println!(
                "sync complete: run_id={} names={} groups={} inserted={} updated={} unresolved={}",
                summary.run_id,
                summary.names_collected,
                summary.groups,
                summary.inserted,
                summary.updated,
                summary.unresolved
            );
            if !summary.skipped_sources.is_empty() {
                println!("skipped unconfigured sources: {}", summary.skipped_sources.join(", "));
            }
            if !summary.suspected_duplicates.is_empty() {
                println!(
                    "suspected same-name stations: {}",
                    summary.suspected_duplicates.join(", ")
                );
            }
        }
        Commands::Supplement => {
            let summary = transit_sync::run_supplement(config).await?;
            println!(
                "supplement complete: run_id={} total={} updated={} not_found={} failed={} success_rate={:.1}%",
                summary.run_id,
                summary.total,
                summary.updated,
                summary.not_found,
                summary.failed,
                summary.success_rate
            );
        }
        Commands::Serve => {
            transit_web::serve(config).await?;
        }
        Commands::Migrate => {
            transit_sync::migrate(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
