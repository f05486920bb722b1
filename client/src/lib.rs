//! # Arena Client Library
//!
//! Client half of the arena session core: the connect handshake, a receive
//! thread, and a local copy of the world kept in line with what the server
//! says.
//!
//! ## Architecture Overview
//!
//! ### Transport
//! [`network::UdpClient`] performs a blocking handshake (resent every
//! 250 ms until accepted or timed out) and then polls the socket on a
//! dedicated thread, handing each datagram to a registered handler.
//!
//! ### Threading
//! The receive thread never touches the world. [`app::ClientApp`] installs a
//! handler that copies each payload into a job on a
//! [`main_queue::MainThreadQueue`]; the owning thread runs those jobs when it
//! calls [`app::ClientApp::pump`].
//!
//! ### Reconciliation
//! [`dispatcher::Dispatcher`] maps message types onto
//! [`world::ClientWorld`] handlers. Creation handlers reuse an existing
//! mapping, then adopt an unmapped local player entity, and only then spawn.
//! Entity creations that arrive before the handshake token are queued and
//! replayed once the token is known.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::app::{ClientApp, ClientConfig};
//!
//! let mut app = ClientApp::new(ClientConfig {
//!     name: "Alice".to_string(),
//!     auto_ready: true,
//!     ..ClientConfig::default()
//! });
//! app.connect()?;
//! loop {
//!     app.pump();
//!     // read app.world(), send input...
//! #   break;
//! }
//! # Ok::<(), client::error::ClientError>(())
//! ```

pub mod app;
pub mod dispatcher;
pub mod error;
pub mod main_queue;
pub mod network;
pub mod world;

pub use error::ClientError;
