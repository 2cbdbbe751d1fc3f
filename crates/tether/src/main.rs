//! Tether: relay bridge between a collaboration platform and an
//! agent-hosting runtime.
//!
//! Subcommands:
//! - `daemon`: run the bridge (stream listeners, router, relay, web)
//! - `check-config`: validate a configuration file and exit

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether::config::Config;
use tether::daemon;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Agent relay bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon
    Daemon {
        /// Path to the configuration file
        #[arg(long, env = "TETHER_CONFIG", default_value = "/etc/tether/config.toml")]
        config: PathBuf,
    },

    /// Validate the configuration file and exit
    CheckConfig {
        /// Path to the configuration file
        #[arg(long, env = "TETHER_CONFIG", default_value = "/etc/tether/config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config } => {
            let config = Config::load(&config).map_err(|e| miette::miette!("{}", e))?;
            daemon::run(config).await
        }
        Commands::CheckConfig { config } => {
            let config = Config::load(&config).map_err(|e| miette::miette!("{}", e))?;
            println!(
                "configuration ok: {} agent(s), platform {}",
                config.agents.len(),
                config.platform_url
            );
            for agent in &config.agents {
                println!(
                    "  {} (org {}, auto_subscribe {}, history {})",
                    agent.name, agent.org, agent.auto_subscribe, agent.history_depth
                );
            }
            Ok(())
        }
    }
}
