//! Strato - broker CLI entrypoint.
//!
//! Usage:
//!   strato start --config config/strato.toml
//!   strato check-config --config config/strato.toml

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

use strato::config::Config;

#[derive(Parser)]
#[command(name = "strato")]
#[command(version)]
#[command(about = "Strato MQTT broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Load and validate a configuration file, then exit
    CheckConfig(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/strato.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => {
            let config = Config::load(&args.config)?;
            init_tracing(config.telemetry.log_level.as_deref())?;
            strato::server::run(config).await
        }
        Commands::CheckConfig(args) => {
            let config = Config::load(&args.config)?;
            println!(
                "ok: {} listener(s), qos0 depth {}, qos1/2 depth {}",
                config.listeners.len(),
                config.limits.qos0_queue_depth,
                config.limits.qos12_queue_depth
            );
            Ok(())
        }
    }
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(())
}
