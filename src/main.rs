//! solhub — multi-server IPMI v2.0 Serial-over-LAN console aggregator.
//!
//! Maintains persistent RMCP+ sessions to every BMC the inventory names,
//! captures their serial consoles, detects boot lifecycle events, fans
//! output out to live subscribers and persists cleaned logs.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "solhub",
    version,
    about = "Multi-server IPMI Serial-over-LAN console aggregator"
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory (logs, analytics, inventory cache).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = solhub::Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    solhub::hub::daemon::run(config).await
}
