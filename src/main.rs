use clap::{Parser, Subcommand};
use claude_bridge::{BridgeArgs, BridgeConfig, BridgeManager, CliBinary, Result};
use std::net::{IpAddr, SocketAddr};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "claude-bridge")]
#[command(about = "OpenAI-compatible chat completions API backed by the claude CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OpenAI-compatible API server
    Serve {
        #[arg(long, env = "CLAUDE_BRIDGE_HOST", default_value = "127.0.0.1")]
        host: IpAddr,
        #[arg(short, long, env = "CLAUDE_BRIDGE_PORT", default_value = "8080")]
        port: u16,
        #[command(flatten)]
        bridge: BridgeArgs,
    },
    /// Check that the claude CLI can be found and report its version
    Check {
        /// Path or name of the claude CLI binary
        #[arg(long, env = "CLAUDE_BRIDGE_CLI_PATH", default_value = "claude")]
        cli_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port, bridge } => {
            let manager = BridgeManager::new(BridgeConfig::from(bridge));
            manager.serve(SocketAddr::new(host, port)).await?
        }
        Commands::Check { cli_path } => {
            let binary = CliBinary::resolve(&cli_path)?;
            let version = binary.version().await?;
            println!("{} ({})", binary.path().display(), version);
        }
    }

    Ok(())
}
