//! bluelink - reliable, resumable messaging between two phones over BLE
//!
//! The link layer of a conversation app: one phone advertises a GATT service
//! and accepts connection requests, the other connects to it, and both then
//! exchange ordered, acknowledged messages that survive brief radio dropouts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bluelink::ble::{Connection, GattClientTransport, Message};
//! use bluelink::config::LinkConfig;
//!
//! # async fn demo() -> Result<(), bluelink::LinkError> {
//! let (transport, _host) = GattClientTransport::new();
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel::<bluelink::ConnectionEvent>();
//! let connection = Connection::new(Arc::new(transport), "Ada", LinkConfig::default(), Arc::new(events))?;
//! connection.send_message(Message::text("hello"), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod config;

use thiserror::Error;

pub use ble::{Connection, ConnectionCallback, ConnectionEvent, Message, Peer, Role};
pub use config::LinkConfig;

/// Error types for link operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("BLE transport error: {0}")]
    Transport(#[from] ble::TransportError),

    #[error("Invalid peer name: {0:?}")]
    InvalidName(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation not available to the {0}")]
    WrongRole(ble::Role),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Connection destroyed")]
    Destroyed,

    #[error("Configuration error: {0}")]
    Configuration(String),
}
