//! Host-driven GATT transports
//!
//! The host platform (Android, iOS, a desktop BLE stack) owns the radio. These
//! adapters turn transport calls into [`GattOperation`]s that the host drains,
//! executes with its native GATT client or server, and completes by id. What
//! the host observes in return is pushed to the connection as
//! [`TransportEvent`](super::adapter::TransportEvent)s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::adapter::{Characteristic, LinkTransport, Role, TransportError};
use super::peer::DeviceAddress;

/// Radio operation for the host to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOperation {
    Connect {
        device: DeviceAddress,
    },
    CancelConnect {
        device: DeviceAddress,
    },
    Disconnect {
        device: DeviceAddress,
    },
    /// Client role: write-with-response on the remote server
    WriteCharacteristic {
        device: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Server role: notification to a subscribed client
    NotifyCharacteristic {
        device: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl GattOperation {
    pub fn device(&self) -> &DeviceAddress {
        match self {
            GattOperation::Connect { device }
            | GattOperation::CancelConnect { device }
            | GattOperation::Disconnect { device }
            | GattOperation::WriteCharacteristic { device, .. }
            | GattOperation::NotifyCharacteristic { device, .. } => device,
        }
    }
}

/// Operation awaiting execution, identified for completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub id: u64,
    pub operation: GattOperation,
}

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<bool>>>>;

/// Shared plumbing between an adapter and its host side
struct HostQueue {
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<PendingOperation>,
    waiting: Waiters,
}

impl HostQueue {
    fn new() -> (Self, HostOperations) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let waiting: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let queue = Self {
            next_id: AtomicU64::new(1),
            outbound,
            waiting: waiting.clone(),
        };
        (queue, HostOperations { inbound, waiting })
    }

    /// Queue an operation and wait for the host's verdict
    async fn submit(&self, operation: GattOperation) -> Result<bool, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);

        tracing::trace!("Queued GATT operation {}: {:?}", id, operation);
        if self.outbound.send(PendingOperation { id, operation }).is_err() {
            self.waiting.lock().remove(&id);
            return Err(TransportError::Closed);
        }
        rx.await.map_err(|_| TransportError::Closed)
    }
}

/// Host-side end of an adapter: drain operations, report outcomes
pub struct HostOperations {
    inbound: mpsc::UnboundedReceiver<PendingOperation>,
    waiting: Waiters,
}

impl HostOperations {
    /// Next operation to execute; `None` once the adapter is dropped
    pub async fn next(&mut self) -> Option<PendingOperation> {
        self.inbound.recv().await
    }

    pub fn try_next(&mut self) -> Option<PendingOperation> {
        self.inbound.try_recv().ok()
    }

    /// Report the outcome of an operation. Returns false for unknown ids.
    pub fn complete(&self, id: u64, success: bool) -> bool {
        self.completer().complete(id, success)
    }

    /// Cloneable handle for completing from platform callback threads
    pub fn completer(&self) -> OperationCompleter {
        OperationCompleter {
            waiting: self.waiting.clone(),
        }
    }
}

#[derive(Clone)]
pub struct OperationCompleter {
    waiting: Waiters,
}

impl OperationCompleter {
    pub fn complete(&self, id: u64, success: bool) -> bool {
        match self.waiting.lock().remove(&id) {
            Some(waiter) => waiter.send(success).is_ok(),
            None => {
                tracing::warn!("Completion for unknown GATT operation {}", id);
                false
            }
        }
    }
}

/// Initiator binding: the local device is the GATT client
pub struct GattClientTransport {
    queue: HostQueue,
}

impl GattClientTransport {
    pub fn new() -> (Self, HostOperations) {
        let (queue, host) = HostQueue::new();
        (Self { queue }, host)
    }
}

#[async_trait]
impl LinkTransport for GattClientTransport {
    fn role(&self) -> Role {
        Role::Initiator
    }

    async fn connect(&self, device: &DeviceAddress) -> Result<(), TransportError> {
        let device = device.clone();
        match self.queue.submit(GattOperation::Connect { device: device.clone() }).await? {
            true => Ok(()),
            false => Err(TransportError::ConnectionFailed(device.to_string())),
        }
    }

    async fn cancel_connect(&self, device: &DeviceAddress) -> Result<(), TransportError> {
        let device = device.clone();
        match self.queue.submit(GattOperation::CancelConnect { device: device.clone() }).await? {
            true => Ok(()),
            false => Err(TransportError::NotConnected(device.to_string())),
        }
    }

    async fn write(
        &self,
        device: &DeviceAddress,
        characteristic: Characteristic,
        value: Vec<u8>,
    ) -> Result<(), TransportError> {
        let operation = GattOperation::WriteCharacteristic {
            device: device.clone(),
            characteristic: characteristic.uuid(),
            value,
        };
        match self.queue.submit(operation).await? {
            true => Ok(()),
            false => Err(TransportError::WriteFailed(format!("{:?} to {}", characteristic, device))),
        }
    }

    async fn disconnect(&self, device: &DeviceAddress) -> Result<(), TransportError> {
        let device = device.clone();
        match self.queue.submit(GattOperation::Disconnect { device: device.clone() }).await? {
            true => Ok(()),
            false => Err(TransportError::NotConnected(device.to_string())),
        }
    }
}

/// Acceptor binding: the local device hosts the GATT server
pub struct GattServerTransport {
    queue: HostQueue,
}

impl GattServerTransport {
    pub fn new() -> (Self, HostOperations) {
        let (queue, host) = HostQueue::new();
        (Self { queue }, host)
    }
}

#[async_trait]
impl LinkTransport for GattServerTransport {
    fn role(&self) -> Role {
        Role::Acceptor
    }

    async fn connect(&self, _device: &DeviceAddress) -> Result<(), TransportError> {
        Err(TransportError::OperationNotSupported(
            "GATT server cannot initiate connections".to_string(),
        ))
    }

    async fn cancel_connect(&self, _device: &DeviceAddress) -> Result<(), TransportError> {
        Err(TransportError::OperationNotSupported(
            "GATT server has no outstanding connections".to_string(),
        ))
    }

    async fn write(
        &self,
        device: &DeviceAddress,
        characteristic: Characteristic,
        value: Vec<u8>,
    ) -> Result<(), TransportError> {
        let operation = GattOperation::NotifyCharacteristic {
            device: device.clone(),
            characteristic: characteristic.uuid(),
            value,
        };
        match self.queue.submit(operation).await? {
            true => Ok(()),
            false => Err(TransportError::WriteFailed(format!("{:?} to {}", characteristic, device))),
        }
    }

    async fn disconnect(&self, device: &DeviceAddress) -> Result<(), TransportError> {
        let device = device.clone();
        match self.queue.submit(GattOperation::Disconnect { device: device.clone() }).await? {
            true => Ok(()),
            false => Err(TransportError::NotConnected(device.to_string())),
        }
    }
}
