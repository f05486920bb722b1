//! Glue between the transport, the receive thread and the client world

use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::main_queue::MainThreadQueue;
use crate::network::{ReceiveHandler, UdpClient};
use crate::world::{ClientPhase, ClientWorld};
use log::{info, warn};
use shared::protocol::ServerAccept;
use std::sync::Arc;
use std::time::Duration;

/// Work posted by the receive thread for the world owner.
pub type Job = Box<dyn FnOnce(&mut ClientWorld) + Send>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub connect_timeout: Duration,
    /// Send a ready message right after the handshake.
    pub auto_ready: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: shared::DEFAULT_PORT,
            name: "Player".to_string(),
            connect_timeout: Duration::from_secs(5),
            auto_ready: false,
        }
    }
}

/// Owns the world and applies server messages to it on the caller's thread.
///
/// The receive thread never touches the world: it copies each payload into
/// a job on the main-thread queue, and [`ClientApp::pump`] runs those jobs.
pub struct ClientApp {
    config: ClientConfig,
    client: UdpClient,
    jobs: Arc<MainThreadQueue<Job>>,
    dispatcher: Arc<Dispatcher>,
    world: ClientWorld,
}

impl ClientApp {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_dispatcher(config, Dispatcher::with_default_handlers())
    }

    pub fn with_dispatcher(config: ClientConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            client: UdpClient::new(),
            jobs: Arc::new(MainThreadQueue::new()),
            dispatcher: Arc::new(dispatcher),
            world: ClientWorld::new(),
        }
    }

    pub fn world(&self) -> &ClientWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut ClientWorld {
        &mut self.world
    }

    pub fn client(&self) -> &UdpClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut UdpClient {
        &mut self.client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected() && self.world.phase() != ClientPhase::Disconnected
    }

    fn receive_handler(&self) -> ReceiveHandler {
        let jobs = Arc::clone(&self.jobs);
        let dispatcher = Arc::clone(&self.dispatcher);
        Arc::new(move |message_type: u8, payload: &[u8]| {
            let payload = payload.to_vec();
            let dispatcher = Arc::clone(&dispatcher);
            jobs.post(Box::new(move |world: &mut ClientWorld| {
                dispatcher.dispatch(world, message_type, &payload);
            }));
        })
    }

    /// Handshakes with the configured server. Blocks for at most the
    /// configured timeout.
    pub fn connect(&mut self) -> Result<ServerAccept, ClientError> {
        // Registered before the handshake so nothing sent right after the
        // accept is missed.
        let handler = self.receive_handler();
        self.client.start_receive_loop(handler);

        let accept = self.client.connect(
            &self.config.host,
            self.config.port,
            &self.config.name,
            shared::PROTOCOL_VERSION,
            self.config.connect_timeout,
        )?;
        self.world.set_token(accept.player_id);

        if self.config.auto_ready {
            self.client.send_ready(true)?;
        }
        Ok(accept)
    }

    /// Runs every queued job against the world. Returns how many ran.
    pub fn pump(&mut self) -> usize {
        let jobs = self.jobs.drain();
        let count = jobs.len();
        for job in jobs {
            job(&mut self.world);
        }
        count
    }

    pub fn send_input(&mut self, input_flags: u8) -> Result<u32, ClientError> {
        self.client.send_input(input_flags)
    }

    /// Sends the shoot intent and mirrors it locally.
    pub fn set_firing(&mut self, firing: bool) -> Result<(), ClientError> {
        self.client.send_shoot(firing)?;
        if let Some(token) = self.world.token() {
            self.world.on_shoot(token, firing);
        }
        Ok(())
    }

    /// Says goodbye if connected and stops the receive thread.
    pub fn disconnect(&mut self) {
        if let Some(token) = self.client.token() {
            info!("Disconnecting from server");
            if let Err(e) = self.client.send_disconnect(token) {
                warn!("Failed to send disconnect: {}", e);
            }
        }
        self.client.stop_receive_loop(true);
    }
}
