//! peer-transport: WebSocket transport for maintained peer connections.
//!
//! Connections are established by the per-peer maintainers from `peer-core`
//! and by an inbound listener; both feed one registry that decides whether a
//! peer is available. Outbound calls go through any `PeerList`.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod outbound;
pub mod registry;
mod server;
pub mod transport;

// Re-export key types for convenience
pub use config::{ConfigError, TransportConfig, TransportConfigBuilder};
pub use connection::{Connection, Direction};
pub use error::{CallError, TransportError};
pub use handler::{Echo, Handler, Handlers};
pub use message::{Frame, Handshake, MAX_FRAME_SIZE};
pub use outbound::Outbound;
pub use registry::ConnectionRegistry;
pub use transport::WsTransport;
