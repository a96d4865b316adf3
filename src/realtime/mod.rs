//! Real-time communication: multiplexed WebSocket endpoints and broadcast.
//!
//! - [`Multiplexer`] claims upgrade requests by exact path and performs the
//!   handshake.
//! - [`Connection`] is one accepted session handed to the endpoint callback.
//! - [`BroadcastRegistry`] tracks live connections per endpoint and fans
//!   messages out to them.
//!
//! A connection is registered before its callback runs. It is unregistered as
//! soon as the peer closes, a write to it fails, or the callback returns,
//! whichever comes first.

use thiserror::Error;

pub mod connection;
pub mod registry;
pub mod upgrade;

pub use connection::{Connection, ConnectionId, DeliveryError};
pub use registry::BroadcastRegistry;
pub use tokio_tungstenite::tungstenite::Message;
pub use upgrade::{IntoConnectHandler, Multiplexer, UpgradeEndpoint};

/// Errors from registering or accepting WebSocket endpoints.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("websocket endpoint path {0:?} must start with '/' and carry no query string")]
    InvalidPath(String),

    #[error("websocket endpoint {0:?} is already registered")]
    DuplicateEndpoint(String),

    #[error("websocket handshake rejected: {0}")]
    Handshake(&'static str),

    #[error("I/O error during websocket handshake: {0}")]
    Io(#[from] std::io::Error),
}
