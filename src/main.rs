//! bluelink demonstration
//!
//! Runs an initiator and an acceptor over the in-process loopback radio: a
//! connection request, a short conversation, a radio dropout in the middle of
//! a long message, the silent resume, and a graceful goodbye.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bluelink::ble::{
    ConnectionEvent, DeviceAddress, GattClientTransport, GattServerTransport, LoopbackRadio, Message, Peer,
};
use bluelink::config::{init_logging, LinkConfig};
use bluelink::Connection;
use tokio::sync::mpsc;
use tracing::info;

async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Result<ConnectionEvent> {
    events.recv().await.context("connection event stream closed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = LinkConfig {
        enable_logging: true,
        log_level: Some(std::env::var("BLUELINK_LOG").unwrap_or_else(|_| "info".to_string())),
        ..LinkConfig::default()
    };
    init_logging(&config);

    info!("🚀 Starting bluelink demonstration...");

    let radio = LoopbackRadio::new();
    let phone_a = DeviceAddress::new("AA:AA:AA:AA:AA:01");
    let phone_b = DeviceAddress::new("BB:BB:BB:BB:BB:02");

    let (client, client_host) = GattClientTransport::new();
    let (client_events, mut alice_events) = mpsc::unbounded_channel::<ConnectionEvent>();
    let alice = Connection::new(Arc::new(client), "Alice", config.clone(), Arc::new(client_events))?;
    radio.attach(phone_a.clone(), client_host, alice.event_sink());

    let (server, server_host) = GattServerTransport::new();
    let (server_events, mut bob_events) = mpsc::unbounded_channel::<ConnectionEvent>();
    let bob = Connection::new(Arc::new(server), "Bob", config, Arc::new(server_events))?;
    radio.attach(phone_b.clone(), server_host, bob.event_sink());

    // Handshake
    alice.connect(&Peer::new("Bob", phone_b.clone())).await?;
    let request = match next_event(&mut bob_events).await? {
        ConnectionEvent::ConnectionRequest(peer) => peer,
        other => bail!("expected a connection request, got {:?}", other),
    };
    info!("📥 Bob got a request from {}", request);
    bob.accept_connection(&request).await?;
    let bob_peer = match next_event(&mut alice_events).await? {
        ConnectionEvent::ConnectionSuccess { peer, .. } => peer,
        other => bail!("expected connection success, got {:?}", other),
    };
    info!("✅ Alice connected to {}", bob_peer);

    // Conversation
    alice.send_message(Message::text("Hola, ¿qué tal?"), Some(&bob_peer)).await?;
    loop {
        if let ConnectionEvent::MessageReceived { message, .. } = next_event(&mut bob_events).await? {
            info!("💬 Bob received: {}", message.text_content());
            break;
        }
    }

    // Dropout in the middle of a long message
    radio.drop_after_writes(&phone_a, 2);
    let long = "A sentence long enough to need several fragments. ".repeat(10);
    let sending = alice.send_message(Message::text(&long), Some(&bob_peer));
    let watching = async {
        loop {
            match next_event(&mut alice_events).await? {
                ConnectionEvent::ConnectionLost(peer) => info!("⚠️  Alice lost {}", peer),
                ConnectionEvent::ConnectionResumed(peer) => {
                    info!("🔄 Alice resumed with {}", peer);
                    return Ok::<_, anyhow::Error>(());
                }
                _ => {}
            }
        }
    };
    let (sent, resumed) = tokio::join!(sending, watching);
    sent?;
    resumed?;
    loop {
        if let ConnectionEvent::MessageReceived { message, .. } = next_event(&mut bob_events).await? {
            info!("💬 Bob received {} bytes after the dropout", message.payload.len());
            break;
        }
    }

    // Goodbye
    alice.disconnect(&bob_peer).await?;
    loop {
        if let ConnectionEvent::Disconnected(peer) = next_event(&mut alice_events).await? {
            info!("👋 Alice disconnected from {}", peer);
            break;
        }
    }

    alice.destroy().await?;
    bob.destroy().await?;
    info!("🎉 bluelink demonstration completed!");
    Ok(())
}
