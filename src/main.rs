//! Data-plane control component of the seed/shoot VPN. One binary, one
//! subcommand per deployment role.

mod bonding;
mod commands;
mod config;
mod constants;
mod ippool;
mod network;
mod openvpn;
mod pathctl;
mod tunnel;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::firewall::HookMode;
use network::cidr::Cidr;

#[derive(Parser, Debug)]
#[command(name = "havpn", version, about = "Data-plane control for the HA seed/shoot VPN")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure kernel settings, firewall rules and the bonding aggregate
    Setup,

    /// Probe shoot peers and keep routes pointed at a healthy primary
    PathController,

    /// Receive peer advertisements and materialise per-peer tunnels
    TunnelController,

    /// OpenVPN up/down hook locking down the VPN device
    Firewall {
        /// Device to configure
        #[arg(long)]
        device: String,

        /// Hook direction
        #[arg(long, value_enum)]
        mode: HookMode,

        /// Shoot networks to route over the device on up
        #[arg(long = "shoot-network")]
        shoot_networks: Vec<Cidr>,
    },

    /// Serve OpenVPN liveness and readiness over HTTP
    Readiness,

    /// Assemble seed-server values and non-HA NAT rules
    Server,
}

#[tokio::main]
async fn main() -> Result<(), commands::CommandError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Setup => commands::setup::run(config::ClientConfig::from_env()?).await,
        Commands::PathController => {
            commands::path_controller::run(config::PathControllerConfig::from_env()?).await
        }
        Commands::TunnelController => commands::tunnel_controller::run().await,
        Commands::Firewall { device, mode, shoot_networks } => {
            commands::firewall::run(device, mode, shoot_networks).await
        }
        Commands::Readiness => commands::readiness::run(config::ServerConfig::from_env()?).await,
        Commands::Server => commands::server::run(config::ServerConfig::from_env()?).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "command failed");
    }
    result
}
