//! RMEM CLI
//!
//! Remote memory client and directory server over the soft fabric.

mod config;
mod interactive;
mod logging;
mod menu;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rmem_core::{Client, Server};
use rmem_transport::{Fabric, SoftFabric};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use config::{Config, expand_home};
use interactive::Console;

/// RMEM - remote memory sessions and region directory
#[derive(Parser)]
#[command(name = "rmem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/rmem/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a server and open the interactive menu
    Client {
        /// Server host name or address
        #[arg(required = true)]
        address: String,

        /// Server port
        #[arg(required = true)]
        port: u16,
    },

    /// Accept clients and serve the region directory
    Server {
        /// Port to listen on (0 picks one)
        #[arg(default_value_t = 0)]
        port: u16,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = expand_home(&cli.config);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if config_path == Config::default_path() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)
            .with_context(|| format!("cannot load {}", config_path.display()))?
    };
    config.validate()?;

    match cli.command {
        Commands::Client { address, port } => {
            logging::init_client(&config.logging.level, cli.verbose);
            run_client(&config, &address, port)
        }
        Commands::Server { port } => {
            let _guard = logging::init_server(
                &config.logging.server_log_dir,
                &config.logging.level,
                cli.verbose,
            )?;
            run_server(&config, port)
        }
    }
}

fn resolve(address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{address} resolves to no address"))
}

fn run_client(config: &Config, address: &str, port: u16) -> anyhow::Result<()> {
    let server = resolve(address, port)?;
    tracing::info!("connecting to {}", server);

    let fabric = SoftFabric::tcp();
    let client = Client::connect(&fabric, server, &config.client)
        .with_context(|| format!("cannot connect to {server}"))?;

    let stdin = io::stdin();
    let mut console = Console::new(stdin.lock(), io::stdout());
    interactive::run_client(&client, &mut console)
}

fn run_server(config: &Config, port: u16) -> anyhow::Result<()> {
    let fabric: Arc<dyn Fabric> = Arc::new(SoftFabric::tcp());
    let server = Server::bind(fabric, config.server.clone(), port)
        .with_context(|| format!("cannot listen on port {port}"))?;
    tracing::info!("server started on port {}", server.port());

    let stdin = io::stdin();
    let mut console = Console::new(stdin.lock(), io::stdout());
    interactive::run_server(&server, &mut console)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_client() {
        let cli = Cli::try_parse_from(["rmem", "client", "10.0.0.1", "50000"]).unwrap();
        match cli.command {
            Commands::Client { address, port } => {
                assert_eq!(address, "10.0.0.1");
                assert_eq!(port, 50000);
            }
            Commands::Server { .. } => panic!("expected client"),
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_server_port_defaults_to_ephemeral() {
        let cli = Cli::try_parse_from(["rmem", "-v", "server"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Server { port: 0 }));
    }

    #[test]
    fn test_cli_client_needs_port() {
        assert!(Cli::try_parse_from(["rmem", "client", "localhost"]).is_err());
    }

    #[test]
    fn test_resolve_loopback() {
        let addr = resolve("127.0.0.1", 50000).unwrap();
        assert_eq!(addr.port(), 50000);
    }
}
