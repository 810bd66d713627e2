//! # entity-watch
//!
//! CLI for polling remote entity collections for created, updated and
//! deleted records.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use entity_watch_config::config::AppConfig;
use entity_watch_core::{build_registry, PollScheduler, SchedulerConfig};
use entity_watch_engine::WatchRegistry;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "entity-watch")]
#[command(about = "Change detection for remote entity collections", long_about = None)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one poll cycle and print detected changes as JSON lines
    Poll {
        /// Poll only this entity
        #[arg(long, short)]
        entity: Option<String>,
    },

    /// Poll every configured entity on an interval until Ctrl-C
    Watch {
        /// Seconds between cycles, overriding [poll].interval_secs
        #[arg(long, short)]
        interval: Option<u64>,
    },

    /// Clear stored cursors so the next poll starts a fresh baseline
    #[command(group(ArgGroup::new("target").required(true).args(["entity", "all"])))]
    Reset {
        #[arg(long, short)]
        entity: Option<String>,

        /// Reset every configured entity
        #[arg(long)]
        all: bool,
    },

    /// Print the stored cursors for an entity
    State {
        #[arg(long, short)]
        entity: String,
    },

    /// List configured entities
    Entities,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref())?;

    match args.command {
        Commands::Entities => {
            print_entities(&config);
            Ok(())
        }
        command => {
            // The blocking HTTP client must be created and dropped outside
            // the async runtime, so the registry is built here.
            let registry = Arc::new(build_registry(&config)?);
            run(command, &config, registry)
        }
    }
}

fn run(command: Commands, config: &AppConfig, registry: Arc<WatchRegistry>) -> Result<()> {
    match command {
        Commands::Poll { entity } => {
            let changes = match entity {
                Some(entity) => {
                    ensure_configured(&registry, &entity)?;
                    registry.poll_entity(&entity)?
                }
                None => registry.poll()?,
            };

            let mut stdout = std::io::stdout().lock();
            for change in &changes {
                serde_json::to_writer(&mut stdout, change)?;
                writeln!(stdout)?;
            }
            info!("Detected {} changes", changes.len());
        }

        Commands::Watch { interval } => {
            if registry.entities().is_empty() {
                warn!("No entities configured; nothing to watch");
                return Ok(());
            }

            let mut scheduler_config = SchedulerConfig::from(&config.poll);
            if let Some(secs) = interval {
                scheduler_config.interval_secs = secs;
            }
            let scheduler = PollScheduler::new(registry.clone(), scheduler_config);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(scheduler.run())?;
        }

        Commands::Reset { entity, all } => {
            if all {
                registry.reset_all()?;
                info!("Reset {} entities", registry.entities().len());
            } else if let Some(entity) = entity {
                registry.reset(&entity)?;
                info!("Reset {}", entity);
            }
        }

        Commands::State { entity } => {
            let state = registry.state(&entity)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Entities => print_entities(config),
    }

    Ok(())
}

fn ensure_configured(registry: &WatchRegistry, entity: &str) -> Result<()> {
    if !registry.is_watching(entity) {
        bail!("Entity {} is not configured", entity);
    }
    Ok(())
}

fn print_entities(config: &AppConfig) {
    for watcher in config.watcher_configs() {
        let detects: Vec<&str> = [
            (watcher.detect_created, "created"),
            (watcher.detect_updated, "updated"),
            (watcher.detect_deleted, "deleted"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect();

        println!(
            "{}\tkey={}\tupdated={}\tdetect={}",
            watcher.entity,
            watcher.primary_key,
            watcher.update_field,
            detects.join(",")
        );
    }
}
