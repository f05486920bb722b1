//! # Arena Server Library
//!
//! Authoritative UDP session core for the arena shooter. The server owns the
//! session table and the entity registry; clients only send intent (connect,
//! ready, input, fire) and receive authoritative state back.
//!
//! ## Architecture
//!
//! ### Network side
//! [`transport::UdpServer`] runs two tokio tasks around one socket. The
//! receive task turns datagrams into [`queue::PendingPacket`]s and pushes
//! them onto the [`queue::MessageQueue`]; the send task drains datagrams the
//! simulation produced. Nothing on this side touches session or game state.
//!
//! ### Simulation side
//! [`simulation::ServerEcs`] drains the queue once per tick, resolves every
//! packet to a session and routes it by phase:
//! - **Lobby** ([`lobby::LobbyHandler`]): connect handshake, ready toggles,
//!   roster broadcasts. No entities exist yet.
//! - **In game** ([`game::GameHandler`]): player entities, input to
//!   velocity, fire intent, and the per-tick position broadcast.
//!
//! Handlers get a [`context::ServerContext`] by reference instead of reaching
//! for globals, so they can be exercised in tests with a
//! [`transport::RecordingSink`] and no socket.
//!
//! ### Instances
//! A front-end server can launch secondary servers of the same binary on
//! other ports ([`instance::InstanceManager`]) and advertise them to its
//! clients.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::instance::InstanceManager;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let server = Server::bind(config, InstanceManager::disabled()).await?;
//!     // Ticks, sweeps idle sessions every 30s, stops on Ctrl-C
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod game;
pub mod instance;
pub mod lobby;
pub mod network;
pub mod players;
pub mod queue;
pub mod session;
pub mod simulation;
pub mod spawn;
pub mod transport;

pub use error::ServerError;
