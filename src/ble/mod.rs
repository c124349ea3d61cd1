//! Reliable peer-to-peer messaging over Bluetooth Low Energy
//!
//! Two phones talk over a fixed set of GATT characteristics: one acts as GATT
//! client ([`Role::Initiator`]), the other as GATT server ([`Role::Acceptor`]).
//! On top of that link this module provides connection requests with
//! accept/reject, fragmentation with per-fragment acknowledgement and retry,
//! graceful disconnection, and silent resumption after a dropped link.

pub mod adapter;
pub mod callback;
pub mod channel;
pub mod connection;
pub mod fragment;
pub mod host;
pub mod loopback;
pub mod message;
pub mod peer;
pub mod sequence;
pub mod timer;

pub use adapter::{Characteristic, LinkTransport, Role, TransportError, TransportEvent, SERVICE_UUID};
pub use callback::{ConnectionCallback, ConnectionEvent, ConnectionFailure};
pub use channel::PayloadKind;
pub use connection::{Connection, TransportEventSink};
pub use fragment::{FragmentType, WireMessage};
pub use host::{GattClientTransport, GattOperation, GattServerTransport, HostOperations, OperationCompleter, PendingOperation};
pub use loopback::LoopbackRadio;
pub use message::{Message, TEXT_HEADER};
pub use peer::{is_valid_name, DeviceAddress, Peer, MAX_NAME_LENGTH};
pub use sequence::SequenceNumber;
