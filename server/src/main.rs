use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::instance::{InstanceManager, ProcessLauncher};
use server::network::Server;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,
    /// Seconds of silence before a session is dropped
    #[clap(long, default_value = "300")]
    session_timeout: u64,
    /// Maximum number of players in the lobby
    #[clap(long, default_value = "8")]
    max_players: usize,
    /// Run as a secondary instance launched by a front-end server
    #[clap(long)]
    instance: bool,
    /// Seconds an instance may stay empty before exiting
    #[clap(long, default_value = "60")]
    instance_idle_timeout: u64,
    /// First port handed to launched instances
    #[clap(long)]
    instance_port_base: Option<u16>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            instance_port_base: self
                .instance_port_base
                .unwrap_or_else(|| self.port.saturating_add(1)),
            bind_host: self.host,
            port: self.port,
            tick_rate: self.tick_rate.max(1),
            session_timeout: Duration::from_secs(self.session_timeout),
            max_players: self.max_players.clamp(1, shared::MAX_PLAYERS),
            instance_mode: self.instance,
            instance_idle_timeout: Duration::from_secs(self.instance_idle_timeout),
            ..defaults
        }
    }
}

/// Parses command-line arguments, binds the socket and runs the server until
/// Ctrl-C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Args::parse().into_config();

    let instances = if config.instance_mode {
        InstanceManager::disabled()
    } else {
        match ProcessLauncher::current_exe(config.bind_host.clone()) {
            Ok(launcher) => InstanceManager::new(
                Box::new(launcher),
                config.instance_port_base,
                config.max_instances,
            ),
            Err(e) => {
                error!("Cannot locate server executable, instances disabled: {}", e);
                InstanceManager::disabled()
            }
        }
    };

    info!("Starting server on {}", config.bind_address());
    let server = Server::bind(config, instances).await?;
    server.run().await?;

    info!("Server stopped");
    Ok(())
}
