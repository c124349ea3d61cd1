//! Application-facing notifications
//!
//! Peers are handed out as owned copies; nothing passed to a callback is ever
//! mutated afterwards by the link layer.

use tokio::sync::mpsc;

use super::adapter::Role;
use super::message::Message;
use super::peer::Peer;

/// Why a connection attempt ended without a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// The acceptor explicitly declined the request
    Rejected,
    /// Hardware failure, timeout or lost link during the handshake
    Failed,
}

/// Receiver of link-layer events
///
/// Callbacks run on the connection's serialized context and must not block.
#[allow(unused_variables)]
pub trait ConnectionCallback: Send + Sync {
    /// An initiator asked to connect; answer with accept or reject
    fn on_connection_request(&self, peer: Peer) {}

    fn on_connection_success(&self, peer: Peer, role: Role) {}

    fn on_connection_failed(&self, peer: Peer, reason: ConnectionFailure) {}

    /// The link dropped; a silent reconnection window has started
    fn on_connection_lost(&self, peer: Peer) {}

    fn on_connection_resumed(&self, peer: Peer) {}

    fn on_message_received(&self, message: Message, role: Role) {}

    fn on_data_received(&self, data: Message, role: Role) {}

    fn on_peer_updated(&self, old_peer: Peer, new_peer: Peer) {}

    fn on_disconnected(&self, peer: Peer) {}

    /// The disconnection notice could not be delivered; a forced disconnect
    /// follows and `on_disconnected` still fires
    fn on_disconnection_failed(&self) {}
}

/// Callback surfaced as a value, for event-loop style consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectionRequest(Peer),
    ConnectionSuccess { peer: Peer, role: Role },
    ConnectionFailed { peer: Peer, reason: ConnectionFailure },
    ConnectionLost(Peer),
    ConnectionResumed(Peer),
    MessageReceived { message: Message, role: Role },
    DataReceived { data: Message, role: Role },
    PeerUpdated { old_peer: Peer, new_peer: Peer },
    Disconnected(Peer),
    DisconnectionFailed,
}

impl ConnectionCallback for mpsc::UnboundedSender<ConnectionEvent> {
    fn on_connection_request(&self, peer: Peer) {
        let _ = self.send(ConnectionEvent::ConnectionRequest(peer));
    }

    fn on_connection_success(&self, peer: Peer, role: Role) {
        let _ = self.send(ConnectionEvent::ConnectionSuccess { peer, role });
    }

    fn on_connection_failed(&self, peer: Peer, reason: ConnectionFailure) {
        let _ = self.send(ConnectionEvent::ConnectionFailed { peer, reason });
    }

    fn on_connection_lost(&self, peer: Peer) {
        let _ = self.send(ConnectionEvent::ConnectionLost(peer));
    }

    fn on_connection_resumed(&self, peer: Peer) {
        let _ = self.send(ConnectionEvent::ConnectionResumed(peer));
    }

    fn on_message_received(&self, message: Message, role: Role) {
        let _ = self.send(ConnectionEvent::MessageReceived { message, role });
    }

    fn on_data_received(&self, data: Message, role: Role) {
        let _ = self.send(ConnectionEvent::DataReceived { data, role });
    }

    fn on_peer_updated(&self, old_peer: Peer, new_peer: Peer) {
        let _ = self.send(ConnectionEvent::PeerUpdated { old_peer, new_peer });
    }

    fn on_disconnected(&self, peer: Peer) {
        let _ = self.send(ConnectionEvent::Disconnected(peer));
    }

    fn on_disconnection_failed(&self) {
        let _ = self.send(ConnectionEvent::DisconnectionFailed);
    }
}
