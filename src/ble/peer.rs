//! Peer identity and per-session link state
//!
//! A [`Peer`] is a plain value handed to the application. The mutable session
//! flags live in [`LinkState`], which only a channel owns.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::sequence::is_transmittable;

/// Longest display name accepted for a peer
pub const MAX_NAME_LENGTH: usize = 64;

/// Platform handle of a remote radio (MAC address or OS-assigned identifier)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote endpoint of a session
///
/// Identity is the protocol-level name; the device address may change across
/// reconnections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub device: DeviceAddress,
}

impl Peer {
    pub fn new(name: impl Into<String>, device: DeviceAddress) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }

    /// Peer known only by its radio, before the identity exchange
    pub(crate) fn unnamed(device: DeviceAddress) -> Self {
        Self {
            name: String::new(),
            device,
        }
    }

    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Peer {}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_named() {
            write!(f, "{} ({})", self.name, self.device)
        } else {
            write!(f, "<unnamed> ({})", self.device)
        }
    }
}

/// Check that a name survives the wire encoding
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name.bytes().all(is_transmittable)
}

/// Lifecycle flags of one session. Not mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    pub hardware_connected: bool,
    /// Hardware link plus completed handshake
    pub connected: bool,
    pub reconnecting: bool,
    pub requesting_reconnection: bool,
    pub disconnecting: bool,
}

impl LinkState {
    /// Whether fragments may be put on the air right now
    pub fn can_transmit(&self) -> bool {
        self.hardware_connected && self.connected && !self.reconnecting && !self.disconnecting
    }

    /// Whether the application has been told about this peer
    pub fn is_announced(&self) -> bool {
        self.connected || self.reconnecting
    }
}
