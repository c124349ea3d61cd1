//! In-process radio for host-driven transports
//!
//! Stands in for the platform BLE stack: it drains the [`GattOperation`]s of
//! every attached adapter, links clients to servers, carries writes and
//! notifications across, and reports what each side would observe. Faults
//! (link loss, out of range, a link that dies mid-transfer) are injected from
//! the outside.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::adapter::{Characteristic, TransportEvent};
use super::connection::TransportEventSink;
use super::host::{GattOperation, HostOperations, PendingOperation};
use super::peer::DeviceAddress;

#[derive(Default)]
struct Radio {
    sinks: HashMap<DeviceAddress, TransportEventSink>,
    /// Unordered pairs of linked devices
    links: HashSet<(DeviceAddress, DeviceAddress)>,
    out_of_range: HashSet<DeviceAddress>,
    /// Fragment writes left before the sender's links drop
    drop_after: HashMap<DeviceAddress, usize>,
}

fn link_key(a: &DeviceAddress, b: &DeviceAddress) -> (DeviceAddress, DeviceAddress) {
    if a.as_str() <= b.as_str() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl Radio {
    fn post(&self, device: &DeviceAddress, event: TransportEvent) {
        if let Some(sink) = self.sinks.get(device) {
            sink.post(event);
        }
    }

    fn is_linked(&self, a: &DeviceAddress, b: &DeviceAddress) -> bool {
        self.links.contains(&link_key(a, b))
    }

    fn unlink(&mut self, a: &DeviceAddress, b: &DeviceAddress) -> bool {
        if !self.links.remove(&link_key(a, b)) {
            return false;
        }
        self.post(a, TransportEvent::HardwareDisconnected { device: b.clone() });
        self.post(b, TransportEvent::HardwareDisconnected { device: a.clone() });
        true
    }

    fn unlink_all(&mut self, device: &DeviceAddress) {
        let peers: Vec<DeviceAddress> = self
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == device {
                    Some(b.clone())
                } else if b == device {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            self.unlink(device, &peer);
        }
    }

    /// Execute one operation issued by `origin`; returns the outcome
    fn execute(&mut self, origin: &DeviceAddress, operation: GattOperation) -> bool {
        match operation {
            GattOperation::Connect { device } => {
                let reachable = self.sinks.contains_key(&device)
                    && !self.out_of_range.contains(&device)
                    && !self.out_of_range.contains(origin);
                if !reachable {
                    return false;
                }
                if self.links.insert(link_key(origin, &device)) {
                    self.post(origin, TransportEvent::HardwareConnected { device: device.clone() });
                    self.post(&device, TransportEvent::HardwareConnected { device: origin.clone() });
                }
                true
            }
            GattOperation::CancelConnect { .. } => true,
            GattOperation::Disconnect { device } => self.unlink(origin, &device),
            GattOperation::WriteCharacteristic {
                device,
                characteristic,
                value,
            }
            | GattOperation::NotifyCharacteristic {
                device,
                characteristic,
                value,
            } => {
                let Some(characteristic) = Characteristic::from_uuid(characteristic) else {
                    return false;
                };
                if !self.is_linked(origin, &device) {
                    return false;
                }
                self.post(
                    &device,
                    TransportEvent::Received {
                        device: origin.clone(),
                        characteristic,
                        value,
                    },
                );
                if matches!(characteristic, Characteristic::MessageSend | Characteristic::DataSend) {
                    self.count_fragment_write(origin);
                }
                true
            }
        }
    }

    fn count_fragment_write(&mut self, origin: &DeviceAddress) {
        let Some(left) = self.drop_after.get_mut(origin) else {
            return;
        };
        *left = left.saturating_sub(1);
        if *left == 0 {
            self.drop_after.remove(origin);
            tracing::debug!("Loopback: dropping links of {} after fragment writes", origin);
            self.unlink_all(origin);
        }
    }
}

/// Shared in-process radio that any number of adapters can attach to
#[derive(Default)]
pub struct LoopbackRadio {
    radio: Arc<Mutex<Radio>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an adapter on the air under `device`. Operations from `host` are
    /// executed; events for this device go to `sink`.
    pub fn attach(&self, device: DeviceAddress, host: HostOperations, sink: TransportEventSink) {
        self.radio.lock().sinks.insert(device.clone(), sink);
        let radio = self.radio.clone();
        let pump = tokio::spawn(async move {
            let mut host = host;
            while let Some(PendingOperation { id, operation }) = host.next().await {
                let success = radio.lock().execute(&device, operation);
                host.complete(id, success);
            }
        });
        self.pumps.lock().push(pump);
    }

    /// Sever the link between two devices, as a radio dropout would
    pub fn drop_link(&self, a: &DeviceAddress, b: &DeviceAddress) -> bool {
        self.radio.lock().unlink(a, b)
    }

    /// Moving out of range drops every link and fails new connects
    pub fn set_reachable(&self, device: &DeviceAddress, reachable: bool) {
        let mut radio = self.radio.lock();
        if reachable {
            radio.out_of_range.remove(device);
        } else {
            radio.out_of_range.insert(device.clone());
            radio.unlink_all(device);
        }
    }

    /// Drop every link of `device` right after its next `writes` fragment writes
    pub fn drop_after_writes(&self, device: &DeviceAddress, writes: usize) {
        self.radio.lock().drop_after.insert(device.clone(), writes.max(1));
    }

    /// Announce `device` to every other attached adapter, as a scan hit
    pub fn advertise(&self, device: &DeviceAddress, name: Option<&str>) {
        let radio = self.radio.lock();
        if radio.out_of_range.contains(device) {
            return;
        }
        for (other, sink) in &radio.sinks {
            if other != device {
                sink.post(TransportEvent::DeviceDiscovered {
                    device: device.clone(),
                    name: name.map(str::to_string),
                });
            }
        }
    }

    pub fn is_linked(&self, a: &DeviceAddress, b: &DeviceAddress) -> bool {
        self.radio.lock().is_linked(a, b)
    }
}

impl Drop for LoopbackRadio {
    fn drop(&mut self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
    }
}
