//! Integration tests for bluelink
//!
//! Two or more connections talk over the loopback radio; the tokio clock is
//! paused so protocol timeouts elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use bluelink::ble::{
    ConnectionEvent, ConnectionFailure, DeviceAddress, GattClientTransport, GattServerTransport, LoopbackRadio,
    Message, Peer, Role,
};
use bluelink::{Connection, LinkConfig, LinkError};
use tokio::sync::mpsc;

struct Phone {
    connection: Connection,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    device: DeviceAddress,
}

impl Phone {
    fn initiator(radio: &LoopbackRadio, name: &str, address: &str, config: LinkConfig) -> Self {
        let (transport, host) = GattClientTransport::new();
        let (tx, events) = mpsc::unbounded_channel::<ConnectionEvent>();
        let connection = Connection::new(Arc::new(transport), name, config, Arc::new(tx)).unwrap();
        let device = DeviceAddress::new(address);
        radio.attach(device.clone(), host, connection.event_sink());
        Self {
            connection,
            events,
            device,
        }
    }

    fn acceptor(radio: &LoopbackRadio, name: &str, address: &str, config: LinkConfig) -> Self {
        let (transport, host) = GattServerTransport::new();
        let (tx, events) = mpsc::unbounded_channel::<ConnectionEvent>();
        let connection = Connection::new(Arc::new(transport), name, config, Arc::new(tx)).unwrap();
        let device = DeviceAddress::new(address);
        radio.attach(device.clone(), host, connection.event_sink());
        Self {
            connection,
            events,
            device,
        }
    }

    async fn expect<T>(&mut self, pred: impl FnMut(ConnectionEvent) -> Option<T>) -> T {
        wait_for(&mut self.events, pred).await
    }

    /// Everything delivered so far, without waiting
    fn drain(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Wait for the first event matching `pred`, skipping others
async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    mut pred: impl FnMut(ConnectionEvent) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(found) = pred(event) {
                return found;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("timed out waiting for event")
}

/// Initiator connects, acceptor accepts; returns each side's view of the other
async fn connect_pair(initiator: &mut Phone, acceptor: &mut Phone, acceptor_name: &str) -> (Peer, Peer) {
    initiator
        .connection
        .connect(&Peer::new(acceptor_name, acceptor.device.clone()))
        .await
        .unwrap();

    let request = acceptor
        .expect(|e| match e {
            ConnectionEvent::ConnectionRequest(peer) => Some(peer),
            _ => None,
        })
        .await;
    acceptor.connection.accept_connection(&request).await.unwrap();

    let remote = initiator
        .expect(|e| match e {
            ConnectionEvent::ConnectionSuccess { peer, role } => {
                assert_eq!(role, Role::Initiator);
                Some(peer)
            }
            _ => None,
        })
        .await;
    acceptor
        .expect(|e| match e {
            ConnectionEvent::ConnectionSuccess { role, .. } => {
                assert_eq!(role, Role::Acceptor);
                Some(())
            }
            _ => None,
        })
        .await;
    (remote, request)
}

fn count_disconnected(events: &[ConnectionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::Disconnected(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_connect_accept_and_converse() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());

    let (bob_peer, alice_peer) = connect_pair(&mut alice, &mut bob, "Bob").await;
    assert_eq!(bob_peer.name, "Bob");
    assert_eq!(alice_peer.name, "Alice");
    assert_eq!(alice_peer.device, alice.device);
    assert_eq!(alice.connection.connected_peers(), vec![bob_peer.clone()]);
    assert_eq!(bob.connection.connected_peers(), vec![alice_peer.clone()]);

    alice
        .connection
        .send_message(Message::text("hello"), Some(&bob_peer))
        .await
        .unwrap();
    let received = bob
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, role } => {
                assert_eq!(role, Role::Acceptor);
                Some(message)
            }
            _ => None,
        })
        .await;
    assert_eq!(received.text_content(), "hello");
    assert_eq!(received.sender.as_ref().map(|p| p.name.as_str()), Some("Alice"));

    bob.connection
        .send_message(Message::text("hi back"), Some(&alice_peer))
        .await
        .unwrap();
    let reply = alice
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(reply.text_content(), "hi back");
}

#[tokio::test(start_paused = true)]
async fn test_multi_fragment_message_and_data() {
    let config = LinkConfig {
        max_fragment_size: 20,
        ..LinkConfig::default()
    };
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", config.clone());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", config);
    let (bob_peer, _) = connect_pair(&mut alice, &mut bob, "Bob").await;

    let text = "The quick brown fox jumps over the lazy dog. ".repeat(8);
    alice
        .connection
        .send_message(Message::text(&text), Some(&bob_peer))
        .await
        .unwrap();
    let received = bob
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(received.text_content(), text);

    let blob: Vec<u8> = (0..=255u8).collect();
    alice
        .connection
        .send_data(Message::new("7z", blob.clone()), None)
        .await
        .unwrap();
    let data = bob
        .expect(|e| match e {
            ConnectionEvent::DataReceived { data, .. } => Some(data),
            _ => None,
        })
        .await;
    assert_eq!(data.header, "7z");
    assert_eq!(data.payload, blob);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());

    alice
        .connection
        .connect(&Peer::new("Bob", bob.device.clone()))
        .await
        .unwrap();
    let request = bob
        .expect(|e| match e {
            ConnectionEvent::ConnectionRequest(peer) => Some(peer),
            _ => None,
        })
        .await;
    bob.connection.reject_connection(&request).await.unwrap();

    let reason = alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    assert_eq!(reason, ConnectionFailure::Rejected);
    assert!(alice.connection.connected_peers().is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(bob.connection.connected_peers().is_empty());
    assert!(
        !bob.drain()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ConnectionFailed { .. })),
        "a rejecting acceptor is not told its own rejection failed"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_fails_to_connect() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    radio.set_reachable(&bob.device, false);

    alice
        .connection
        .connect(&Peer::new("Bob", bob.device.clone()))
        .await
        .unwrap();
    let (peer, reason) = alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionFailed { peer, reason } => Some((peer, reason)),
            _ => None,
        })
        .await;
    assert_eq!(peer.name, "Bob");
    assert_eq!(reason, ConnectionFailure::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());

    let started = tokio::time::Instant::now();
    alice
        .connection
        .connect(&Peer::new("Bob", bob.device.clone()))
        .await
        .unwrap();
    bob.expect(|e| match e {
        ConnectionEvent::ConnectionRequest(_) => Some(()),
        _ => None,
    })
    .await;

    let reason = alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    assert_eq!(reason, ConnectionFailure::Failed);
    assert!(started.elapsed() >= Duration::from_secs(10));

    let reason = bob
        .expect(|e| match e {
            ConnectionEvent::ConnectionFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    assert_eq!(reason, ConnectionFailure::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_link_drop_mid_message_resumes_and_delivers_once() {
    let config = LinkConfig {
        max_fragment_size: 20,
        ..LinkConfig::default()
    };
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", config.clone());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", config);
    let (bob_peer, _) = connect_pair(&mut alice, &mut bob, "Bob").await;

    radio.drop_after_writes(&alice.device, 3);
    let text = "0123456789".repeat(10);
    alice
        .connection
        .send_message(Message::text(&text), Some(&bob_peer))
        .await
        .unwrap();

    let events = alice.drain();
    assert!(events.iter().any(|e| matches!(e, ConnectionEvent::ConnectionLost(_))));
    assert!(events.iter().any(|e| matches!(e, ConnectionEvent::ConnectionResumed(_))));

    let received = bob
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(received.text_content(), text);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let later = bob.drain();
    assert!(
        !later
            .iter()
            .any(|e| matches!(e, ConnectionEvent::MessageReceived { .. })),
        "message delivered twice"
    );
    assert_eq!(alice.connection.connected_peers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_out_of_range_disconnects_exactly_once() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    let (bob_peer, _) = connect_pair(&mut alice, &mut bob, "Bob").await;

    let started = tokio::time::Instant::now();
    radio.set_reachable(&bob.device, false);
    alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionLost(_) => Some(()),
            _ => None,
        })
        .await;
    assert!(alice.connection.connected_peers().is_empty());

    // Queued while the session is in limbo; settled when it ends
    let pending = alice.connection.send_message(Message::text("anyone?"), Some(&bob_peer));
    let gone = wait_for(&mut alice.events, |e| match e {
        ConnectionEvent::Disconnected(peer) => Some(peer),
        _ => None,
    });
    let (sent, gone) = tokio::join!(pending, gone);
    sent.unwrap();
    assert_eq!(gone.name, "Bob");
    assert!(started.elapsed() >= Duration::from_secs(30));

    tokio::time::sleep(Duration::from_secs(60)).await;
    let alice_rest = alice.drain();
    assert_eq!(count_disconnected(&alice_rest), 0);
    assert!(!alice_rest
        .iter()
        .any(|e| matches!(e, ConnectionEvent::ConnectionFailed { .. })));
    assert_eq!(count_disconnected(&bob.drain()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_resumes_session() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    let (bob_peer, _) = connect_pair(&mut alice, &mut bob, "Bob").await;

    radio.set_reachable(&bob.device, false);
    alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionLost(_) => Some(()),
            _ => None,
        })
        .await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    radio.set_reachable(&bob.device, true);
    radio.advertise(&bob.device, Some("Bob"));
    alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionResumed(peer) => Some(peer),
            _ => None,
        })
        .await;
    bob.expect(|e| match e {
        ConnectionEvent::ConnectionResumed(_) => Some(()),
        _ => None,
    })
    .await;

    alice
        .connection
        .send_message(Message::text("still there"), Some(&bob_peer))
        .await
        .unwrap();
    let received = bob
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(received.text_content(), "still there");

    // The reconnection window must not fire after a successful resume
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count_disconnected(&alice.drain()), 0);
    assert_eq!(count_disconnected(&bob.drain()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_reconnecting_is_immediate() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    let (bob_peer, _) = connect_pair(&mut alice, &mut bob, "Bob").await;

    radio.set_reachable(&bob.device, false);
    alice
        .expect(|e| match e {
            ConnectionEvent::ConnectionLost(_) => Some(()),
            _ => None,
        })
        .await;

    let started = tokio::time::Instant::now();
    alice.connection.disconnect(&bob_peer).await.unwrap();
    alice
        .expect(|e| match e {
            ConnectionEvent::Disconnected(_) => Some(()),
            _ => None,
        })
        .await;
    assert!(started.elapsed() < Duration::from_secs(1));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(count_disconnected(&alice.drain()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_disconnect_notifies_both_sides() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    let (bob_peer, alice_peer) = connect_pair(&mut alice, &mut bob, "Bob").await;

    alice.connection.disconnect(&bob_peer).await.unwrap();
    let gone = alice
        .expect(|e| match e {
            ConnectionEvent::Disconnected(peer) => Some(peer),
            _ => None,
        })
        .await;
    assert_eq!(gone, bob_peer);
    let gone = bob
        .expect(|e| match e {
            ConnectionEvent::Disconnected(peer) => Some(peer),
            _ => None,
        })
        .await;
    assert_eq!(gone, alice_peer);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let alice_rest = alice.drain();
    assert_eq!(count_disconnected(&alice_rest), 0);
    assert!(!alice_rest
        .iter()
        .any(|e| matches!(e, ConnectionEvent::DisconnectionFailed)));
    assert_eq!(count_disconnected(&bob.drain()), 0);
    assert!(!radio.is_linked(&alice.device, &bob.device));
}

#[tokio::test(start_paused = true)]
async fn test_name_update_reaches_peer() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    connect_pair(&mut alice, &mut bob, "Bob").await;

    assert!(matches!(
        alice.connection.update_name("").await,
        Err(LinkError::InvalidName(_))
    ));
    alice.connection.update_name("Alicia").await.unwrap();
    let (old, new) = bob
        .expect(|e| match e {
            ConnectionEvent::PeerUpdated { old_peer, new_peer } => Some((old_peer, new_peer)),
            _ => None,
        })
        .await;
    assert_eq!(old.name, "Alice");
    assert_eq!(new.name, "Alicia");
    assert_eq!(new.device, alice.device);

    bob.connection
        .send_message(Message::text("nice name"), Some(&new))
        .await
        .unwrap();
    assert_eq!(bob.connection.connected_peers(), vec![new]);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_every_peer() {
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    let mut carol = Phone::acceptor(&radio, "Carol", "CC:03", LinkConfig::default());
    connect_pair(&mut alice, &mut bob, "Bob").await;
    connect_pair(&mut alice, &mut carol, "Carol").await;
    assert_eq!(alice.connection.connected_peers().len(), 2);

    alice
        .connection
        .send_message(Message::text("hello all"), None)
        .await
        .unwrap();
    for phone in [&mut bob, &mut carol] {
        let message = phone
            .expect(|e| match e {
                ConnectionEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .await;
        assert_eq!(message.text_content(), "hello all");
    }

    alice.connection.disconnect_all().await.unwrap();
    for phone in [&mut bob, &mut carol] {
        phone
            .expect(|e| match e {
                ConnectionEvent::Disconnected(_) => Some(()),
                _ => None,
            })
            .await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_api_errors() {
    let radio = LoopbackRadio::new();
    let alice = Phone::initiator(&radio, "Alice", "AA:01", LinkConfig::default());
    let bob = Phone::acceptor(&radio, "Bob", "BB:02", LinkConfig::default());
    let stranger = Peer::new("Mallory", DeviceAddress::new("EE:05"));

    assert!(matches!(
        bob.connection.connect(&stranger).await,
        Err(LinkError::WrongRole(Role::Acceptor))
    ));
    assert!(matches!(
        alice.connection.accept_connection(&stranger).await,
        Err(LinkError::WrongRole(Role::Initiator))
    ));
    assert!(matches!(
        alice.connection.disconnect(&stranger).await,
        Err(LinkError::PeerNotFound(_))
    ));
    assert!(matches!(
        alice.connection.send_message(Message::text("?"), Some(&stranger)).await,
        Err(LinkError::PeerNotFound(_))
    ));
    // No peers at all: nothing to do
    alice
        .connection
        .send_message(Message::text("void"), None)
        .await
        .unwrap();

    // One payload byte per fragment exhausts the sequence space quickly
    let tiny = Phone::initiator(
        &radio,
        "Tiny",
        "DD:04",
        LinkConfig {
            max_fragment_size: 9,
            ..LinkConfig::default()
        },
    );
    let huge = Message::new("00", vec![b'x'; 95 * 95 * 95]);
    assert!(matches!(
        tiny.connection.send_data(huge, None).await,
        Err(LinkError::MessageTooLarge(_))
    ));

    alice.connection.destroy().await.unwrap();
    assert_eq!(
        alice.connection.send_message(Message::text("late"), None).await,
        Err(LinkError::Destroyed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_local_name_is_refused() {
    let (transport, _host) = GattClientTransport::new();
    let (tx, _events) = mpsc::unbounded_channel::<ConnectionEvent>();
    let result = Connection::new(Arc::new(transport), "tab\tname", LinkConfig::default(), Arc::new(tx));
    assert!(matches!(result, Err(LinkError::InvalidName(_))));
}


#[tokio::test(start_paused = true)]
async fn test_simultaneous_long_messages_flow_both_ways() {
    let config = LinkConfig {
        max_fragment_size: 20,
        ..LinkConfig::default()
    };
    let radio = LoopbackRadio::new();
    let mut alice = Phone::initiator(&radio, "Alice", "AA:01", config.clone());
    let mut bob = Phone::acceptor(&radio, "Bob", "BB:02", config.clone());
    let (bob_peer, alice_peer) = connect_pair(&mut alice, &mut bob, "Bob").await;

    let from_alice = "Alice talks at length about the weather today. ".repeat(3);
    let from_bob = "Bob answers with a long story about his commute. ".repeat(3);
    let started = tokio::time::Instant::now();
    let (sent_by_alice, sent_by_bob) = tokio::join!(
        alice.connection.send_message(Message::text(&from_alice), Some(&bob_peer)),
        bob.connection.send_message(Message::text(&from_bob), Some(&alice_peer)),
    );
    sent_by_alice.unwrap();
    sent_by_bob.unwrap();
    // A dozen fragments each way; neither side waited out a resume delay
    assert!(started.elapsed() < Duration::from_millis(config.resume_delay_ms));

    let at_bob = bob
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
    let at_alice = alice
        .expect(|e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(at_bob.text_content(), from_alice);
    assert_eq!(at_alice.text_content(), from_bob);
}

mod manual_host_tests {
    //! The test plays the radio: it executes each GATT operation by hand and
    //! injects what the remote side would send.

    use super::*;
    use bluelink::ble::{Characteristic, GattOperation, HostOperations, TransportEvent, TransportEventSink};

    const ALICE: &str = "AA:01";
    const BOB: &str = "BB:02";

    struct Harness {
        connection: Arc<Connection>,
        host: HostOperations,
        sink: TransportEventSink,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        remote: Peer,
    }

    impl Harness {
        async fn next_op(&mut self) -> (u64, GattOperation) {
            let pending = tokio::time::timeout(Duration::from_secs(60), self.host.next())
                .await
                .expect("no operation issued")
                .expect("transport dropped");
            (pending.id, pending.operation)
        }

        /// Expect a write on `expected`, complete it, return its value
        async fn expect_write(&mut self, expected: Characteristic, success: bool) -> Vec<u8> {
            let (id, op) = self.next_op().await;
            let value = match op {
                GattOperation::WriteCharacteristic {
                    characteristic, value, ..
                }
                | GattOperation::NotifyCharacteristic {
                    characteristic, value, ..
                } if characteristic == expected.uuid() => value,
                other => panic!("expected a {:?} write, got {:?}", expected, other),
            };
            self.host.complete(id, success);
            value
        }

        fn receive(&self, characteristic: Characteristic, value: &[u8]) {
            self.sink.post(TransportEvent::Received {
                device: self.remote.device.clone(),
                characteristic,
                value: value.to_vec(),
            });
        }

        fn spawn_send(&self, text: &str) -> tokio::task::JoinHandle<Result<(), LinkError>> {
            let connection = self.connection.clone();
            let remote = self.remote.clone();
            let message = Message::text(text);
            tokio::spawn(async move { connection.send_message(message, Some(&remote)).await })
        }
    }

    fn ack_for(fragment: &[u8], status: u8) -> Vec<u8> {
        let mut value = fragment[..7].to_vec();
        value.push(status);
        value
    }

    async fn connected_initiator() -> Harness {
        let (transport, host) = GattClientTransport::new();
        let (tx, events) = mpsc::unbounded_channel::<ConnectionEvent>();
        let connection = Connection::new(Arc::new(transport), "Alice", LinkConfig::default(), Arc::new(tx)).unwrap();
        let mut harness = Harness {
            sink: connection.event_sink(),
            connection: Arc::new(connection),
            host,
            events,
            remote: Peer::new("Bob", DeviceAddress::new(BOB)),
        };

        harness.connection.connect(&harness.remote).await.unwrap();
        let (id, op) = harness.next_op().await;
        assert_eq!(
            op,
            GattOperation::Connect {
                device: harness.remote.device.clone()
            }
        );
        harness.host.complete(id, true);
        harness.sink.post(TransportEvent::HardwareConnected {
            device: harness.remote.device.clone(),
        });

        assert_eq!(harness.expect_write(Characteristic::NameExchange, true).await, b"Alice");
        harness.receive(Characteristic::ConnectionResponse, b"ABob");
        wait_for(&mut harness.events, |e| match e {
            ConnectionEvent::ConnectionSuccess { .. } => Some(()),
            _ => None,
        })
        .await;
        harness
    }

    async fn connected_acceptor() -> Harness {
        let (transport, host) = GattServerTransport::new();
        let (tx, events) = mpsc::unbounded_channel::<ConnectionEvent>();
        let connection = Connection::new(Arc::new(transport), "Bob", LinkConfig::default(), Arc::new(tx)).unwrap();
        let mut harness = Harness {
            sink: connection.event_sink(),
            connection: Arc::new(connection),
            host,
            events,
            remote: Peer::new("Alice", DeviceAddress::new(ALICE)),
        };

        harness.sink.post(TransportEvent::HardwareConnected {
            device: harness.remote.device.clone(),
        });
        harness.receive(Characteristic::NameExchange, b"Alice");
        let request = wait_for(&mut harness.events, |e| match e {
            ConnectionEvent::ConnectionRequest(peer) => Some(peer),
            _ => None,
        })
        .await;
        assert_eq!(request.device, harness.remote.device);

        harness.connection.accept_connection(&request).await.unwrap();
        assert_eq!(
            harness.expect_write(Characteristic::ConnectionResponse, true).await,
            b"ABob"
        );
        wait_for(&mut harness.events, |e| match e {
            ConnectionEvent::ConnectionSuccess { .. } => Some(()),
            _ => None,
        })
        .await;
        harness
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_fragment_is_retransmitted_verbatim() {
        let mut alice = connected_initiator().await;
        let send = alice.spawn_send("hi");

        let first = alice.expect_write(Characteristic::MessageSend, true).await;
        assert_eq!(first, b"       100hi");

        // No ack within the timeout: same id, same sequence
        let started = tokio::time::Instant::now();
        let again = alice.expect_write(Characteristic::MessageSend, true).await;
        assert_eq!(again, first);
        assert!(started.elapsed() >= Duration::from_secs(1));

        // A refusal resends right away
        alice.receive(Characteristic::MessageAck, &ack_for(&first, b'0'));
        assert_eq!(alice.expect_write(Characteristic::MessageSend, true).await, first);

        // An ack for some other fragment changes nothing
        alice.receive(Characteristic::MessageAck, b"   !   1");
        alice.receive(Characteristic::MessageAck, &ack_for(&first, b'1'));
        send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_completes_pending_send() {
        let mut alice = connected_initiator().await;
        let send = alice.spawn_send("are you there?");
        alice.expect_write(Characteristic::MessageSend, true).await;

        let remote = alice.remote.clone();
        alice.connection.disconnect(&remote).await.unwrap();
        send.await.unwrap().unwrap();
        assert!(alice.connection.connected_peers().is_empty());

        alice.expect_write(Characteristic::Disconnection, true).await;
        let (id, op) = alice.next_op().await;
        assert_eq!(
            op,
            GattOperation::Disconnect {
                device: remote.device.clone()
            }
        );
        alice.host.complete(id, true);
        alice.sink.post(TransportEvent::HardwareDisconnected {
            device: remote.device.clone(),
        });

        let gone = wait_for(&mut alice.events, |e| match e {
            ConnectionEvent::Disconnected(peer) => Some(peer),
            _ => None,
        })
        .await;
        assert_eq!(gone.name, "Bob");
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeliverable_notice_forces_disconnect() {
        let mut alice = connected_initiator().await;
        let remote = alice.remote.clone();
        alice.connection.disconnect(&remote).await.unwrap();

        alice.expect_write(Characteristic::Disconnection, false).await;
        wait_for(&mut alice.events, |e| match e {
            ConnectionEvent::DisconnectionFailed => Some(()),
            _ => None,
        })
        .await;
        let (id, op) = alice.next_op().await;
        assert!(matches!(op, GattOperation::Disconnect { .. }));
        alice.host.complete(id, true);

        // The radio never reports the link down; the disconnection timer ends it
        wait_for(&mut alice.events, |e| match e {
            ConnectionEvent::Disconnected(_) => Some(()),
            _ => None,
        })
        .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(alice.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_fails_pending_send() {
        let mut alice = connected_initiator().await;
        let send = alice.spawn_send("never mind");
        alice.expect_write(Characteristic::MessageSend, true).await;

        alice.connection.destroy().await.unwrap();
        assert_eq!(send.await.unwrap(), Err(LinkError::Destroyed));
        let gone = wait_for(&mut alice.events, |e| match e {
            ConnectionEvent::Disconnected(peer) => Some(peer),
            _ => None,
        })
        .await;
        assert_eq!(gone.name, "Bob");
        let (_, op) = alice.next_op().await;
        assert!(matches!(op, GattOperation::Disconnect { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_final_fragment_delivered_once() {
        let mut bob = connected_acceptor().await;
        let fragment = b"       100hello";

        bob.receive(Characteristic::MessageSend, fragment);
        bob.receive(Characteristic::MessageSend, fragment);
        // Both copies are acknowledged
        for _ in 0..2 {
            assert_eq!(bob.expect_write(Characteristic::MessageAck, true).await, b"       1");
        }

        let mut delivered = Vec::new();
        while let Ok(event) = bob.events.try_recv() {
            if let ConnectionEvent::MessageReceived { message, role } = event {
                assert_eq!(role, Role::Acceptor);
                delivered.push(message);
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text_content(), "hello");
        assert_eq!(delivered[0].sender.as_ref().map(|p| p.name.as_str()), Some("Alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_burst_holds_outbound_fragments() {
        let mut bob = connected_acceptor().await;

        // First half of a two-fragment message
        bob.receive(Characteristic::MessageSend, b"       000hel");
        bob.expect_write(Characteristic::MessageAck, true).await;

        let started = tokio::time::Instant::now();
        let send = bob.spawn_send("yo");
        let fragment = bob.expect_write(Characteristic::MessageSend, true).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(fragment, b"       100yo");

        // Second half completes the inbound message
        bob.receive(Characteristic::MessageSend, b"      !1lo");
        bob.expect_write(Characteristic::MessageAck, true).await;
        let message = wait_for(&mut bob.events, |e| match e {
            ConnectionEvent::MessageReceived { message, .. } => Some(message),
            _ => None,
        })
        .await;
        assert_eq!(message.text_content(), "hello");

        bob.receive(Characteristic::MessageAck, &ack_for(&fragment, b'1'));
        send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sends_keep_one_message_on_the_air() {
        let mut alice = connected_initiator().await;
        let first_send = alice.spawn_send("one");
        let first = alice.expect_write(Characteristic::MessageSend, true).await;
        assert_eq!(first, b"       100one");

        let second_send = alice.spawn_send("two");
        // Until the first is acked only its fragment goes out, again and again
        assert_eq!(alice.expect_write(Characteristic::MessageSend, true).await, first);
        assert!(!second_send.is_finished());

        alice.receive(Characteristic::MessageAck, &ack_for(&first, b'1'));
        first_send.await.unwrap().unwrap();

        let second = alice.expect_write(Characteristic::MessageSend, true).await;
        assert_eq!(second, b"   !   100two");
        alice.receive(Characteristic::MessageAck, &ack_for(&second, b'1'));
        second_send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reconnect_gives_up_once() {
        let mut alice = connected_initiator().await;
        let remote = alice.remote.clone();
        let started = tokio::time::Instant::now();
        alice.sink.post(TransportEvent::HardwareDisconnected {
            device: remote.device.clone(),
        });
        wait_for(&mut alice.events, |e| match e {
            ConnectionEvent::ConnectionLost(peer) => Some(peer),
            _ => None,
        })
        .await;

        // The radio never answers the reconnect attempt
        let (_, op) = alice.next_op().await;
        assert_eq!(
            op,
            GattOperation::Connect {
                device: remote.device.clone()
            }
        );

        let gone = wait_for(&mut alice.events, |e| match e {
            ConnectionEvent::Disconnected(peer) => Some(peer),
            _ => None,
        })
        .await;
        assert_eq!(gone.name, "Bob");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(event) = alice.events.try_recv() {
            assert!(!matches!(event, ConnectionEvent::Disconnected(_)), "second disconnect: {:?}", event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_needs_an_announced_request() {
        let (transport, host) = GattServerTransport::new();
        let (tx, events) = mpsc::unbounded_channel::<ConnectionEvent>();
        let connection = Connection::new(Arc::new(transport), "Bob", LinkConfig::default(), Arc::new(tx)).unwrap();
        let mut bob = Harness {
            sink: connection.event_sink(),
            connection: Arc::new(connection),
            host,
            events,
            remote: Peer::new("Alice", DeviceAddress::new(ALICE)),
        };

        // Link up, but no name yet
        bob.sink.post(TransportEvent::HardwareConnected {
            device: bob.remote.device.clone(),
        });
        let result = bob.connection.reject_connection(&bob.remote).await;
        assert!(matches!(result, Err(LinkError::InvalidState(_))));
        assert!(bob.host.try_next().is_none());

        bob.receive(Characteristic::NameExchange, b"Alice");
        let request = wait_for(&mut bob.events, |e| match e {
            ConnectionEvent::ConnectionRequest(peer) => Some(peer),
            _ => None,
        })
        .await;
        bob.connection.reject_connection(&request).await.unwrap();
        assert_eq!(bob.expect_write(Characteristic::ConnectionResponse, true).await, b"R");
    }
}
