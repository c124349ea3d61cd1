//! Platform-agnostic GATT transport contract
//!
//! The protocol core never touches a radio API directly. Each role binds the
//! operations below to the platform's GATT client or server primitives and
//! feeds what it observes back as [`TransportEvent`]s.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::peer::DeviceAddress;

/// Which side of the GATT link this connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// GATT client; initiates connections
    Initiator,
    /// GATT server; accepts or rejects incoming requests
    Acceptor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Characteristics of the link service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    MessageSend,
    MessageAck,
    DataSend,
    DataAck,
    NameExchange,
    ConnectionResponse,
    ConnectionResumed,
    NameUpdate,
    Disconnection,
}

impl Characteristic {
    pub const ALL: [Characteristic; 9] = [
        Characteristic::MessageSend,
        Characteristic::MessageAck,
        Characteristic::DataSend,
        Characteristic::DataAck,
        Characteristic::NameExchange,
        Characteristic::ConnectionResponse,
        Characteristic::ConnectionResumed,
        Characteristic::NameUpdate,
        Characteristic::Disconnection,
    ];

    pub fn uuid(self) -> Uuid {
        let suffix: u128 = match self {
            Characteristic::MessageSend => 0x01,
            Characteristic::MessageAck => 0x02,
            Characteristic::DataSend => 0x03,
            Characteristic::DataAck => 0x04,
            Characteristic::NameExchange => 0x05,
            Characteristic::ConnectionResponse => 0x06,
            Characteristic::ConnectionResumed => 0x07,
            Characteristic::NameUpdate => 0x08,
            Characteristic::Disconnection => 0x09,
        };
        Uuid::from_u128(CHARACTERISTIC_UUID_BASE | suffix)
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

/// Link service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400000_b5a3_f393_e0a9_e50e24dc0000);

const CHARACTERISTIC_UUID_BASE: u128 = 0x6e400000_b5a3_f393_e0a9_e50e24dc1000;

/// Something the radio observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    HardwareConnected {
        device: DeviceAddress,
    },
    HardwareDisconnected {
        device: DeviceAddress,
    },
    /// Terminal failure of an outstanding `connect`
    ConnectFailed {
        device: DeviceAddress,
    },
    /// Scan result, used to resume sessions with known peers
    DeviceDiscovered {
        device: DeviceAddress,
        name: Option<String>,
    },
    Received {
        device: DeviceAddress,
        characteristic: Characteristic,
        value: Vec<u8>,
    },
}

/// GATT transport bound to one role
///
/// Futures resolve when the platform reports the outcome of the operation; a
/// resolved `write` means the value was submitted and confirmed by the stack.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    fn role(&self) -> Role;

    /// Open a hardware link. Success is reported separately through
    /// [`TransportEvent::HardwareConnected`].
    async fn connect(&self, device: &DeviceAddress) -> Result<(), TransportError>;

    async fn cancel_connect(&self, device: &DeviceAddress) -> Result<(), TransportError>;

    async fn write(
        &self,
        device: &DeviceAddress,
        characteristic: Characteristic,
        value: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Tear down the hardware link
    async fn disconnect(&self, device: &DeviceAddress) -> Result<(), TransportError>;
}

/// Transport-level error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("BLE device not connected: {0}")]
    NotConnected(String),

    #[error("BLE connection failed: {0}")]
    ConnectionFailed(String),

    #[error("BLE write failed: {0}")]
    WriteFailed(String),

    #[error("BLE operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("BLE transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids_are_distinct_and_resolvable() {
        let mut seen = std::collections::HashSet::new();
        for characteristic in Characteristic::ALL {
            assert!(seen.insert(characteristic.uuid()));
            assert_eq!(Characteristic::from_uuid(characteristic.uuid()), Some(characteristic));
        }
        assert_eq!(Characteristic::from_uuid(SERVICE_UUID), None);
    }
}
