use clap::Parser;
use client::app::{ClientApp, ClientConfig};
use client::world::ClientPhase;
use log::{error, info, warn};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Headless client: joins a lobby, readies up and moves around.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Display name sent in the handshake
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Seconds to wait for the server to accept
    #[arg(long, default_value = "5")]
    connect_timeout: u64,

    /// Do not send a ready message after connecting
    #[arg(long)]
    no_ready: bool,

    /// Directional input flags sent every frame (1 up, 2 down, 4 left, 8 right)
    #[arg(long, default_value = "0")]
    input: u8,

    /// Seconds to stay connected; 0 runs until Ctrl-C
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Ask the server to launch a new instance after connecting
    #[arg(long)]
    create_instance: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        host: args.server.clone(),
        port: args.port,
        name: args.name.clone(),
        connect_timeout: Duration::from_secs(args.connect_timeout),
        auto_ready: !args.no_ready,
    };

    info!("Connecting to {}:{}", config.host, config.port);
    let mut app = tokio::task::spawn_blocking(move || {
        let mut app = ClientApp::new(config);
        app.connect().map(|_| app)
    })
    .await??;

    if args.create_instance {
        app.client().request_instance()?;
    }

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut frame = interval(Duration::from_millis(16));
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ping = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = frame.tick() => {
                app.pump();
                if app.world().phase() == ClientPhase::Disconnected {
                    warn!("Server closed the session");
                    break;
                }
                if app.world().phase() == ClientPhase::InGame {
                    if let Err(e) = app.send_input(args.input) {
                        error!("Failed to send input: {}", e);
                    }
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = app.client().send_ping() {
                    error!("Failed to send ping: {}", e);
                }
                if let Some(rtt) = app.world().rtt_ms() {
                    info!("RTT {} ms, {} entities", rtt, app.world().registry.len());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    app.disconnect();
    info!("Client stopped");
    Ok(())
}
