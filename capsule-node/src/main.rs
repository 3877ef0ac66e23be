//! capsule-node: runs the time capsule delivery scheduler
//!
//! Opens the capsule database in the data directory and ticks the delivery
//! scheduler until interrupted. Several nodes may share one database file;
//! each delivery is still committed exactly once.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use capsule_node::Config;
use time_capsule::events::LoggingSink;
use time_capsule::{CapsuleEngine, SqliteStore};

#[derive(Parser)]
#[command(name = "capsule-node")]
#[command(about = "Delivery scheduler for time capsules")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "capsule-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long, env = "CAPSULE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node ID (overrides config file)
    #[arg(long, env = "CAPSULE_NODE_ID")]
    node_id: Option<String>,

    /// Scheduler interval in seconds (overrides config file)
    #[arg(long, env = "CAPSULE_TICK_INTERVAL")]
    interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Run a single scheduler pass and exit
    Tick,
    /// Print deliveries still waiting for their notification
    Outbox,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("capsule_node=info".parse()?)
                .add_directive("time_capsule=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting capsule-node");
    info!("Config file: {}", cli.config.display());

    let mut config = Config::load_or_default(&cli.config)?;

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(secs) = cli.interval_secs {
        config.engine.scheduler.interval_secs = secs;
    }

    info!("Node ID: {}", config.node.id);
    info!("Data dir: {}", config.node.data_dir.display());

    let store = Arc::new(SqliteStore::open(&config.node.data_dir)?);
    let engine = CapsuleEngine::builder()
        .config(config.engine.clone())
        .store(store)
        .sink(Arc::new(LoggingSink))
        .build();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!(
                node_id = %config.node.id,
                interval_secs = config.engine.scheduler.interval_secs,
                "Scheduler running; press Ctrl-C to stop"
            );
            engine
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    }
                })
                .await;
        }
        Command::Tick => {
            let report = engine.tick_now().await?;
            println!(
                "delivered={} replayed={} held={} failures={}",
                report.delivered.len(),
                report.replay.dispatched,
                report.held,
                report.failures.len()
            );
            for (capsule_id, error) in &report.failures {
                eprintln!("{}: {}", capsule_id, error);
            }
        }
        Command::Outbox => {
            let pending = engine.pending_outbox().await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
    }

    info!("capsule-node stopped");
    Ok(())
}
