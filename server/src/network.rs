//! The server's main loop
//!
//! [`Server`] wires the UDP transport to the simulation and drives it: a
//! fixed-rate tick, a periodic cleanup sweep and, for instance-mode servers,
//! an idle check. The loop ends on Ctrl-C or when the shutdown future
//! passed to [`Server::run_until`] resolves.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::instance::InstanceManager;
use crate::simulation::ServerEcs;
use crate::transport::{InboundRoute, NullSink, UdpServer};
use log::{debug, error, info};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Longest step the simulation is asked to integrate after a stall.
const MAX_TICK_DT: f32 = 0.25;

pub struct Server {
    ecs: ServerEcs,
    udp: UdpServer,
    config: ServerConfig,
}

impl Server {
    /// Binds the socket and builds the simulation. Fails only if the socket
    /// cannot be bound.
    pub async fn bind(config: ServerConfig, instances: InstanceManager) -> Result<Self, ServerError> {
        let mut ecs = ServerEcs::new(config.clone(), Box::new(NullSink), instances);
        let (udp, sink) =
            UdpServer::start(&config.bind_address(), InboundRoute::Queue(ecs.queue())).await?;
        ecs.context_mut().transport.replace_sink(Box::new(sink));

        Ok(Self { ecs, udp, config })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn ecs(&self) -> &ServerEcs {
        &self.ecs
    }

    pub fn ecs_mut(&mut self) -> &mut ServerEcs {
        &mut self.ecs
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs until `shutdown` resolves or an idle instance times out.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let cleanup_period = self.config.cleanup_interval.max(Duration::from_millis(10));
        let mut cleanup_interval = interval_at(Instant::now() + cleanup_period, cleanup_period);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut idle_interval = interval(Duration::from_secs(1));
        idle_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_tick = Instant::now();
        tokio::pin!(shutdown);

        info!(
            "Server running on {} at {} Hz{}",
            self.local_addr(),
            self.config.tick_rate,
            if self.config.instance_mode { " (instance)" } else { "" }
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32().min(MAX_TICK_DT);
                    last_tick = now;
                    self.ecs.tick(dt);
                }

                _ = cleanup_interval.tick() => {
                    debug!("Running session cleanup");
                    self.ecs.cleanup();
                }

                _ = idle_interval.tick() => {
                    if self.ecs.idle_expired(std::time::Instant::now()) {
                        info!("Instance idle for {:?}, exiting", self.config.instance_idle_timeout);
                        break;
                    }
                }
            }
        }

        self.ecs.shutdown();
        // Dropping the channel sink lets the send task flush and finish
        self.ecs.context_mut().transport.replace_sink(Box::new(NullSink));
        self.udp.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::codec::{encode, PacketParser};
    use shared::protocol::{ClientDisconnect, Ping, Pong, SystemMessage, DISCONNECT_REASON_SHUTDOWN};
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    async fn recv_type(socket: &UdpSocket, message_type: u8) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for packet")
                .unwrap();
            if buf[0] == message_type {
                return buf[..len].to_vec();
            }
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip_and_shutdown_notice() {
        let server = Server::bind(test_config(), InstanceManager::disabled())
            .await
            .unwrap();
        let server_addr = server.local_addr();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ping = encode(SystemMessage::Ping, 0, &Ping { client_time: 77 }).unwrap();
        client.send_to(&ping, server_addr).await.unwrap();

        let pong = recv_type(&client, SystemMessage::Pong as u8).await;
        let pong: Pong = PacketParser::new(&pong).get_struct().unwrap();
        assert_eq!(pong.client_time, 77);

        stop_tx.send(()).unwrap();
        let notice = recv_type(&client, SystemMessage::ClientDisconnect as u8).await;
        let notice: ClientDisconnect = PacketParser::new(&notice).get_struct().unwrap();
        assert_eq!(notice.reason, DISCONNECT_REASON_SHUTDOWN);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..ServerConfig::default()
        };
        let result = Server::bind(config, InstanceManager::disabled()).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_idle_instance_exits_on_its_own() {
        let config = ServerConfig {
            instance_mode: true,
            instance_idle_timeout: Duration::from_millis(0),
            ..test_config()
        };
        let server = Server::bind(config, InstanceManager::disabled())
            .await
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.run_until(std::future::pending::<()>()),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
