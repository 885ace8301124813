use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use steward_agent::config::AgentConfig;
use steward_agent::AgentServer;

#[derive(Parser)]
#[command(name = "steward-agent")]
#[command(about = "Site Steward agent - remotely managed host adapter")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address override
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with plain log output (for debugging)
    #[arg(short, long)]
    foreground: bool,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => {
            let mut config = AgentConfig::load_from_file(config_path)?;
            config.apply_env_overrides();
            config
        }
        None => AgentConfig::load_from_env(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // Initialize tracing
    let filter = format!(
        "steward_agent={l},steward_core={l},steward_crypto={l},steward_fetch={l}",
        l = config.log_level
    );
    if args.foreground {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }

    info!(
        version = steward_core::types::AGENT_VERSION,
        "starting steward-agent"
    );

    let server = AgentServer::new(config)?;
    server.start().await?;

    info!("steward-agent stopped");
    Ok(())
}
