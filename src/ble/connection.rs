//! Connection: owner of every peer session of one role
//!
//! All session state lives in a single actor task. Public methods post a
//! command into its inbox and await the reply; transports post
//! [`TransportEvent`]s into the same inbox; timers and write workers post their
//! outcomes there too. Nothing else ever touches a [`Channel`], so there is no
//! session lock to order against the radio callbacks.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::adapter::{Characteristic, LinkTransport, Role, TransportEvent};
use super::callback::{ConnectionCallback, ConnectionFailure};
use super::channel::{Ack, Channel, PayloadKind};
use super::message::Message;
use super::peer::{is_valid_name, DeviceAddress, Peer};
use super::sequence::SequenceNumber;
use super::timer::{ChannelTimers, TimerKind};
use crate::config::LinkConfig;
use crate::LinkError;

const RESPONSE_ACCEPTED: u8 = b'A';
const RESPONSE_REJECTED: u8 = b'R';

/// Actor-local identity of a channel; device addresses can change on resume
pub(crate) type ChannelId = u64;

/// What a spawned write was for, so its completion can be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WritePurpose {
    Fragment {
        kind: PayloadKind,
        id: SequenceNumber,
        sequence: SequenceNumber,
    },
    /// Acks, name updates and resume replies; outcome only logged
    Control,
    NameExchange,
    ResumeRequest,
    Accept,
    Reject,
    /// Acceptor refused to resume an unknown session
    ResumeRefused,
    DisconnectNotice,
}

pub(crate) enum Command {
    Connect {
        peer: Peer,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Accept {
        peer: Peer,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Reject {
        peer: Peer,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Send {
        kind: PayloadKind,
        message: Message,
        receiver: Option<Peer>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        peer: Peer,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    DisconnectAll {
        reply: oneshot::Sender<()>,
    },
    UpdateName {
        name: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Destroy {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub(crate) enum Event {
    Command(Command),
    Transport(TransportEvent),
    TimerFired {
        channel: ChannelId,
        kind: TimerKind,
        generation: u64,
    },
    WriteDone {
        channel: ChannelId,
        purpose: WritePurpose,
        ok: bool,
    },
}

/// Everything a channel needs to act on the outside world
pub(crate) struct LinkContext {
    pub role: Role,
    pub config: LinkConfig,
    transport: Arc<dyn LinkTransport>,
    inbox: mpsc::UnboundedSender<Event>,
}

impl LinkContext {
    /// Write on a worker task; the outcome comes back as `Event::WriteDone`
    pub fn write(
        &self,
        channel: ChannelId,
        device: &DeviceAddress,
        characteristic: Characteristic,
        value: Vec<u8>,
        purpose: WritePurpose,
    ) {
        let transport = self.transport.clone();
        let inbox = self.inbox.clone();
        let device = device.clone();
        tokio::spawn(async move {
            let result = transport.write(&device, characteristic, value).await;
            if let Err(e) = &result {
                tracing::debug!("Write {:?} to {} failed: {}", characteristic, device, e);
            }
            let _ = inbox.send(Event::WriteDone {
                channel,
                purpose,
                ok: result.is_ok(),
            });
        });
    }

    /// Open a hardware link. Only failure is reported from here.
    fn connect(&self, device: &DeviceAddress) {
        let transport = self.transport.clone();
        let inbox = self.inbox.clone();
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.connect(&device).await {
                tracing::warn!("Connect to {} failed: {}", device, e);
                let _ = inbox.send(Event::Transport(TransportEvent::ConnectFailed { device }));
            }
        });
    }

    fn cancel_connect(&self, device: &DeviceAddress) {
        let transport = self.transport.clone();
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.cancel_connect(&device).await {
                tracing::debug!("Cancel connect to {}: {}", device, e);
            }
        });
    }

    fn disconnect(&self, device: &DeviceAddress) {
        let transport = self.transport.clone();
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(&device).await {
                tracing::debug!("Disconnect from {}: {}", device, e);
            }
        });
    }

    pub fn start_timer(&self, timers: &mut ChannelTimers, channel: ChannelId, kind: TimerKind) {
        let after = self.config.timeout(kind);
        timers
            .get_mut(kind)
            .start(after, &self.inbox, |generation| Event::TimerFired {
                channel,
                kind,
                generation,
            });
    }
}

/// A send spanning one or more channels, served one channel at a time
struct SendJob {
    message: Message,
    targets: VecDeque<ChannelId>,
    current: Option<ChannelId>,
    reply: oneshot::Sender<Result<(), LinkError>>,
}

#[derive(Default)]
struct SendQueue {
    active: Option<SendJob>,
    waiting: VecDeque<SendJob>,
}

/// Reliable peer-to-peer link over BLE for one role
///
/// Dropping the handle stops the actor; [`Connection::destroy`] does the same
/// and waits for teardown.
pub struct Connection {
    role: Role,
    inbox: mpsc::UnboundedSender<Event>,
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl Connection {
    /// Start a connection on the current tokio runtime
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        local_name: &str,
        config: LinkConfig,
        callback: Arc<dyn ConnectionCallback>,
    ) -> Result<Self, LinkError> {
        if !is_valid_name(local_name) {
            return Err(LinkError::InvalidName(local_name.to_string()));
        }
        config.validate()?;

        let role = transport.role();
        let (inbox, events) = mpsc::unbounded_channel();
        let peers = Arc::new(Mutex::new(Vec::new()));
        let actor = Actor {
            ctx: LinkContext {
                role,
                config,
                transport,
                inbox: inbox.clone(),
            },
            local_name: local_name.to_string(),
            callback,
            channels: Vec::new(),
            next_channel_id: 1,
            connect_queue: VecDeque::new(),
            connecting: None,
            message_sends: SendQueue::default(),
            data_sends: SendQueue::default(),
            peers: peers.clone(),
            events,
        };
        tokio::spawn(actor.run());

        tracing::info!("🔗 {} connection started as {}", role, local_name);
        Ok(Self { role, inbox, peers })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Where a transport posts what it observes
    pub fn event_sink(&self) -> TransportEventSink {
        TransportEventSink {
            inbox: self.inbox.clone(),
        }
    }

    pub fn handle_transport_event(&self, event: TransportEvent) {
        self.event_sink().post(event);
    }

    /// Fully connected peers, excluding those reconnecting or disconnecting
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Event::Command(make(reply)))
            .map_err(|_| LinkError::Destroyed)?;
        response.await.map_err(|_| LinkError::Destroyed)
    }

    /// Queue a connection attempt. The outcome arrives as
    /// `on_connection_success` or `on_connection_failed`.
    pub async fn connect(&self, peer: &Peer) -> Result<(), LinkError> {
        let peer = peer.clone();
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    pub async fn accept_connection(&self, peer: &Peer) -> Result<(), LinkError> {
        let peer = peer.clone();
        self.request(|reply| Command::Accept { peer, reply }).await?
    }

    pub async fn reject_connection(&self, peer: &Peer) -> Result<(), LinkError> {
        let peer = peer.clone();
        self.request(|reply| Command::Reject { peer, reply }).await?
    }

    /// Deliver a message to one peer, or to every connected peer. Resolves
    /// once each target acknowledged it or was dropped.
    pub async fn send_message(&self, message: Message, receiver: Option<&Peer>) -> Result<(), LinkError> {
        self.send(PayloadKind::Message, message, receiver).await
    }

    pub async fn send_data(&self, data: Message, receiver: Option<&Peer>) -> Result<(), LinkError> {
        self.send(PayloadKind::Data, data, receiver).await
    }

    async fn send(&self, kind: PayloadKind, message: Message, receiver: Option<&Peer>) -> Result<(), LinkError> {
        let receiver = receiver.cloned();
        self.request(|reply| Command::Send {
            kind,
            message,
            receiver,
            reply,
        })
        .await?
    }

    /// Close the session with a peer. `on_disconnected` follows.
    pub async fn disconnect(&self, peer: &Peer) -> Result<(), LinkError> {
        let peer = peer.clone();
        self.request(|reply| Command::Disconnect { peer, reply }).await?
    }

    pub async fn disconnect_all(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::DisconnectAll { reply }).await
    }

    pub async fn update_name(&self, name: &str) -> Result<(), LinkError> {
        let name = name.to_string();
        self.request(|reply| Command::UpdateName { name, reply }).await?
    }

    /// Tear everything down and stop the actor
    pub async fn destroy(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::Destroy { reply: Some(reply) }).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.inbox.send(Event::Command(Command::Destroy { reply: None }));
    }
}

/// Cloneable handle for posting transport events
#[derive(Clone)]
pub struct TransportEventSink {
    inbox: mpsc::UnboundedSender<Event>,
}

impl TransportEventSink {
    /// Returns false once the connection is gone
    pub fn post(&self, event: TransportEvent) -> bool {
        self.inbox.send(Event::Transport(event)).is_ok()
    }
}

struct Actor {
    ctx: LinkContext,
    local_name: String,
    callback: Arc<dyn ConnectionCallback>,
    channels: Vec<Channel>,
    next_channel_id: ChannelId,
    /// Initiator connect attempts waiting for the radio
    connect_queue: VecDeque<ChannelId>,
    /// Attempt currently owning the radio
    connecting: Option<ChannelId>,
    message_sends: SendQueue,
    data_sends: SendQueue,
    peers: Arc<Mutex<Vec<Peer>>>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Command(Command::Destroy { reply }) => {
                    self.destroy();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                Event::Command(command) => self.handle_command(command),
                Event::Transport(event) => self.handle_transport_event(event),
                Event::TimerFired {
                    channel,
                    kind,
                    generation,
                } => self.handle_timer(channel, kind, generation),
                Event::WriteDone { channel, purpose, ok } => self.handle_write_done(channel, purpose, ok),
            }
            self.publish_peers();
        }
        tracing::info!("{} connection stopped", self.ctx.role);
    }

    fn publish_peers(&self) {
        let peers = self
            .channels
            .iter()
            .filter(|c| c.state.connected && !c.state.reconnecting && !c.state.disconnecting)
            .map(|c| c.peer.clone())
            .collect();
        *self.peers.lock() = peers;
    }

    // ------------------------------------------------------------------
    // Channel bookkeeping
    // ------------------------------------------------------------------

    fn channel(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id == id)
    }

    fn by_device(&self, device: &DeviceAddress) -> Option<ChannelId> {
        self.channels.iter().find(|c| c.peer.device == *device).map(|c| c.id)
    }

    /// Resolve an application-supplied peer: by name, then by device
    fn by_peer(&self, peer: &Peer) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|c| c.peer.is_named() && c.peer.name == peer.name)
            .or_else(|| self.channels.iter().find(|c| c.peer.device == peer.device))
            .map(|c| c.id)
    }

    fn add_channel(&mut self, peer: Peer) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        self.channels
            .push(Channel::new(id, peer, self.ctx.config.received_history));
        id
    }

    /// Drop a channel and release everything referring to it
    fn remove_channel(&mut self, id: ChannelId) -> Option<Peer> {
        let index = self.channels.iter().position(|c| c.id == id)?;
        let mut channel = self.channels.remove(index);
        channel.timers.cancel_all();
        self.connect_queue.retain(|queued| *queued != id);
        if self.connecting == Some(id) {
            self.connecting = None;
            self.pump_connections();
        }
        self.finish_channel_send(id, PayloadKind::Message);
        self.finish_channel_send(id, PayloadKind::Data);
        tracing::debug!("Removed channel {} ({})", id, channel.peer);
        Some(channel.peer)
    }

    /// Tear the hardware link down if there is one, then forget the channel
    fn drop_channel(&mut self, id: ChannelId) -> Option<Peer> {
        let channel = self.channel(id)?;
        let (device, hardware_connected) = (channel.peer.device.clone(), channel.state.hardware_connected);
        if self.connecting == Some(id) && !hardware_connected {
            self.ctx.cancel_connect(&device);
        }
        if hardware_connected {
            self.ctx.disconnect(&device);
        }
        self.remove_channel(id)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer, reply } => {
                let _ = reply.send(self.connect(peer));
            }
            Command::Accept { peer, reply } => {
                let _ = reply.send(self.accept(&peer));
            }
            Command::Reject { peer, reply } => {
                let _ = reply.send(self.reject(&peer));
            }
            Command::Send {
                kind,
                message,
                receiver,
                reply,
            } => self.send(kind, message, receiver, reply),
            Command::Disconnect { peer, reply } => {
                let result = match self.by_peer(&peer) {
                    Some(id) => {
                        self.disconnect_channel(id);
                        Ok(())
                    }
                    None => Err(LinkError::PeerNotFound(peer.to_string())),
                };
                let _ = reply.send(result);
            }
            Command::DisconnectAll { reply } => {
                let ids: Vec<ChannelId> = self.channels.iter().map(|c| c.id).collect();
                for id in ids {
                    self.disconnect_channel(id);
                }
                let _ = reply.send(());
            }
            Command::UpdateName { name, reply } => {
                let _ = reply.send(self.update_name(name));
            }
            Command::Destroy { .. } => {}
        }
    }

    fn connect(&mut self, peer: Peer) -> Result<(), LinkError> {
        if self.ctx.role != Role::Initiator {
            return Err(LinkError::WrongRole(self.ctx.role));
        }
        if self.by_peer(&peer).is_some() {
            return Err(LinkError::InvalidState(format!("already linked with {}", peer)));
        }
        tracing::info!("🔄 Connecting to {}", peer);
        let id = self.add_channel(peer);
        self.connect_queue.push_back(id);
        self.pump_connections();
        Ok(())
    }

    /// Put the next queued attempt on the radio
    fn pump_connections(&mut self) {
        if self.connecting.is_some() {
            return;
        }
        while let Some(id) = self.connect_queue.pop_front() {
            let Some(index) = self.channels.iter().position(|c| c.id == id) else {
                continue;
            };
            self.connecting = Some(id);
            let channel = &mut self.channels[index];
            self.ctx
                .start_timer(&mut channel.timers, id, TimerKind::ConnectionComplete);
            self.ctx.connect(&channel.peer.device);
            return;
        }
    }

    fn accept(&mut self, peer: &Peer) -> Result<(), LinkError> {
        if self.ctx.role != Role::Acceptor {
            return Err(LinkError::WrongRole(self.ctx.role));
        }
        let id = self
            .by_peer(peer)
            .ok_or_else(|| LinkError::PeerNotFound(peer.to_string()))?;
        let local_name = self.local_name.clone();
        let ctx = &self.ctx;
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| LinkError::PeerNotFound(peer.to_string()))?;
        if !channel.request_announced || channel.state.connected || channel.answering {
            return Err(LinkError::InvalidState(format!(
                "no pending request from {}",
                peer
            )));
        }
        channel.answering = true;
        let mut response = vec![RESPONSE_ACCEPTED];
        response.extend_from_slice(local_name.as_bytes());
        ctx.write(
            id,
            &channel.peer.device,
            Characteristic::ConnectionResponse,
            response,
            WritePurpose::Accept,
        );
        Ok(())
    }

    fn reject(&mut self, peer: &Peer) -> Result<(), LinkError> {
        if self.ctx.role != Role::Acceptor {
            return Err(LinkError::WrongRole(self.ctx.role));
        }
        let id = self
            .by_peer(peer)
            .ok_or_else(|| LinkError::PeerNotFound(peer.to_string()))?;
        let ctx = &self.ctx;
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| LinkError::PeerNotFound(peer.to_string()))?;
        if channel.state.connected || channel.state.reconnecting {
            return Err(LinkError::InvalidState(format!("{} is already connected", peer)));
        }
        if !channel.request_announced {
            return Err(LinkError::InvalidState(format!(
                "no pending request from {}",
                peer
            )));
        }
        if channel.answering {
            return Err(LinkError::InvalidState(format!("{} is already being answered", peer)));
        }
        channel.answering = true;
        channel.rejected = true;
        ctx.write(
            id,
            &channel.peer.device,
            Characteristic::ConnectionResponse,
            vec![RESPONSE_REJECTED],
            WritePurpose::Reject,
        );
        Ok(())
    }

    fn update_name(&mut self, name: String) -> Result<(), LinkError> {
        if !is_valid_name(&name) {
            return Err(LinkError::InvalidName(name));
        }
        tracing::info!("Local name changed {} → {}", self.local_name, name);
        self.local_name = name;
        for channel in &self.channels {
            if channel.state.can_transmit() {
                self.ctx.write(
                    channel.id,
                    &channel.peer.device,
                    Characteristic::NameUpdate,
                    self.local_name.as_bytes().to_vec(),
                    WritePurpose::Control,
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sends
    // ------------------------------------------------------------------

    fn sends(&mut self, kind: PayloadKind) -> &mut SendQueue {
        match kind {
            PayloadKind::Message => &mut self.message_sends,
            PayloadKind::Data => &mut self.data_sends,
        }
    }

    fn send(
        &mut self,
        kind: PayloadKind,
        message: Message,
        receiver: Option<Peer>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    ) {
        // Reject oversized messages before anything reaches a channel
        let probe = SequenceNumber::new(super::sequence::ID_LENGTH);
        if let Err(e) = super::fragment::split(&message, &probe, self.ctx.config.max_fragment_size) {
            let _ = reply.send(Err(e));
            return;
        }

        let targets: VecDeque<ChannelId> = self
            .channels
            .iter()
            .filter(|c| c.state.is_announced() && !c.state.disconnecting)
            .filter(|c| receiver.as_ref().map(|r| c.peer == *r).unwrap_or(true))
            .map(|c| c.id)
            .collect();
        if let Some(receiver) = &receiver {
            if targets.is_empty() {
                let _ = reply.send(Err(LinkError::PeerNotFound(receiver.to_string())));
                return;
            }
        }

        tracing::debug!("Queued {:?} send to {} channel(s)", kind, targets.len());
        self.sends(kind).waiting.push_back(SendJob {
            message,
            targets,
            current: None,
            reply,
        });
        self.advance_sends(kind);
    }

    /// Move the active job forward until it is waiting on a channel or the
    /// queue is empty
    fn advance_sends(&mut self, kind: PayloadKind) {
        loop {
            let queue = match kind {
                PayloadKind::Message => &mut self.message_sends,
                PayloadKind::Data => &mut self.data_sends,
            };
            if queue.active.is_none() {
                match queue.waiting.pop_front() {
                    Some(job) => queue.active = Some(job),
                    None => return,
                }
            }
            let Some(job) = queue.active.as_mut() else {
                return;
            };
            if job.current.is_some() {
                return;
            }

            let Some(target) = job.targets.pop_front() else {
                if let Some(job) = queue.active.take() {
                    let _ = job.reply.send(Ok(()));
                }
                continue;
            };

            let Some(channel) = self.channels.iter_mut().find(|c| c.id == target) else {
                continue;
            };
            if channel.state.disconnecting {
                tracing::debug!("Skipping {} while it disconnects", channel.peer);
                continue;
            }
            match channel.write(&self.ctx, kind, &job.message) {
                Ok(()) => job.current = Some(target),
                Err(e) => tracing::warn!("Skipping {}: {}", channel.peer, e),
            }
        }
    }

    /// A channel finished (or abandoned) its part of the active job
    fn finish_channel_send(&mut self, channel: ChannelId, kind: PayloadKind) {
        let queue = self.sends(kind);
        let Some(job) = queue.active.as_mut() else {
            return;
        };
        if job.current != Some(channel) {
            return;
        }
        job.current = None;
        self.advance_sends(kind);
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::HardwareConnected { device } => self.on_hardware_connected(device),
            TransportEvent::HardwareDisconnected { device } => self.on_hardware_disconnected(device),
            TransportEvent::ConnectFailed { device } => self.on_connect_failed(device),
            TransportEvent::DeviceDiscovered { device, name } => self.on_device_discovered(device, name),
            TransportEvent::Received {
                device,
                characteristic,
                value,
            } => self.on_received(device, characteristic, value),
        }
    }

    fn on_hardware_connected(&mut self, device: DeviceAddress) {
        match self.ctx.role {
            Role::Initiator => {
                let Some(id) = self.connecting.filter(|id| {
                    self.channels
                        .iter()
                        .any(|c| c.id == *id && c.peer.device == device)
                }) else {
                    tracing::debug!("Ignoring hardware connection to {}", device);
                    return;
                };
                self.connecting = None;
                let local_name = self.local_name.clone();
                if let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) {
                    channel.state.hardware_connected = true;
                    let (characteristic, purpose) = if channel.state.reconnecting {
                        tracing::info!("🔄 Link to {} back, resuming session", channel.peer);
                        (Characteristic::ConnectionResumed, WritePurpose::ResumeRequest)
                    } else {
                        tracing::debug!("Link to {} up, sending connection request", device);
                        (Characteristic::NameExchange, WritePurpose::NameExchange)
                    };
                    self.ctx
                        .write(id, &device, characteristic, local_name.into_bytes(), purpose);
                }
                self.pump_connections();
            }
            Role::Acceptor => {
                if let Some(id) = self.by_device(&device) {
                    if let Some(channel) = self.channel(id) {
                        channel.state.hardware_connected = true;
                    }
                    return;
                }
                tracing::debug!("Incoming link from {}", device);
                let id = self.add_channel(Peer::unnamed(device));
                if let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) {
                    channel.state.hardware_connected = true;
                    self.ctx
                        .start_timer(&mut channel.timers, id, TimerKind::ConnectionComplete);
                }
            }
        }
    }

    fn on_hardware_disconnected(&mut self, device: DeviceAddress) {
        let Some(id) = self.by_device(&device) else {
            tracing::debug!("Hardware disconnect from unknown {}", device);
            return;
        };
        let Some(channel) = self.channel(id) else {
            return;
        };
        let state = channel.state;
        channel.state.hardware_connected = false;

        if state.disconnecting {
            self.finish_disconnection(id);
        } else if state.reconnecting {
            // A reconnect attempt died mid-handshake; wait for rediscovery
            channel.state.requesting_reconnection = false;
            channel.timers.connection_complete.cancel();
            if self.connecting == Some(id) {
                self.connecting = None;
                self.pump_connections();
            }
        } else if state.connected {
            self.connection_lost(id);
        } else {
            self.handshake_failed(id);
        }
    }

    fn connection_lost(&mut self, id: ChannelId) {
        let role = self.ctx.role;
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        tracing::warn!("⚠️  Lost link to {}, trying to resume", channel.peer);
        channel.state.hardware_connected = false;
        channel.state.reconnecting = true;
        channel.suspend_transmission();
        ctx.start_timer(&mut channel.timers, id, TimerKind::Reconnection);
        self.callback.on_connection_lost(channel.peer.clone());

        if role == Role::Initiator {
            channel.state.requesting_reconnection = true;
            self.connect_queue.push_back(id);
            self.pump_connections();
        }
    }

    /// Handshake ended without a session
    fn handshake_failed(&mut self, id: ChannelId) {
        let role = self.ctx.role;
        let Some(channel) = self.channel(id) else {
            return;
        };
        let announced = match role {
            Role::Initiator => true,
            Role::Acceptor => channel.request_announced && !channel.rejected,
        };
        if let Some(peer) = self.drop_channel(id) {
            tracing::warn!("Connection with {} failed", peer);
            if announced {
                self.callback.on_connection_failed(peer, ConnectionFailure::Failed);
            }
        }
    }

    fn on_connect_failed(&mut self, device: DeviceAddress) {
        let Some(id) = self.connecting.filter(|id| {
            self.channels
                .iter()
                .any(|c| c.id == *id && c.peer.device == device)
        }) else {
            return;
        };
        self.connecting = None;
        let Some(channel) = self.channel(id) else {
            return;
        };
        channel.timers.connection_complete.cancel();
        if channel.state.reconnecting {
            tracing::debug!("Reconnect to {} failed, waiting for rediscovery", channel.peer);
            channel.state.requesting_reconnection = false;
            self.pump_connections();
        } else if let Some(peer) = self.remove_channel(id) {
            self.callback.on_connection_failed(peer, ConnectionFailure::Failed);
        }
    }

    fn on_device_discovered(&mut self, device: DeviceAddress, name: Option<String>) {
        if self.ctx.role != Role::Initiator {
            return;
        }
        let Some(channel) = self.channels.iter_mut().find(|c| {
            c.state.reconnecting
                && !c.state.requesting_reconnection
                && (c.peer.device == device || name.as_deref() == Some(c.peer.name.as_str()))
        }) else {
            return;
        };
        tracing::debug!("Rediscovered {} at {}", channel.peer, device);
        channel.peer.device = device;
        channel.state.requesting_reconnection = true;
        self.connect_queue.push_back(channel.id);
        self.pump_connections();
    }

    fn on_received(&mut self, device: DeviceAddress, characteristic: Characteristic, value: Vec<u8>) {
        let Some(id) = self.by_device(&device) else {
            tracing::debug!("Dropping {:?} from unknown {}", characteristic, device);
            return;
        };
        match characteristic {
            Characteristic::MessageSend => self.on_fragment(id, PayloadKind::Message, &value),
            Characteristic::DataSend => self.on_fragment(id, PayloadKind::Data, &value),
            Characteristic::MessageAck => self.on_ack(id, PayloadKind::Message, &value),
            Characteristic::DataAck => self.on_ack(id, PayloadKind::Data, &value),
            Characteristic::NameExchange => self.on_connection_request(id, &value),
            Characteristic::ConnectionResponse => self.on_connection_response(id, &value),
            Characteristic::ConnectionResumed => match self.ctx.role {
                Role::Acceptor => self.on_resume_request(id, &value),
                Role::Initiator => self.on_resume_response(id, &value),
            },
            Characteristic::NameUpdate => self.on_name_update(id, &value),
            Characteristic::Disconnection => self.on_disconnection_notice(id),
        }
    }

    fn on_fragment(&mut self, id: ChannelId, kind: PayloadKind, value: &[u8]) {
        let role = self.ctx.role;
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        if !channel.state.connected || channel.state.disconnecting {
            tracing::debug!("Dropping {:?} fragment from {}: no session", kind, channel.peer);
            return;
        }
        let Some(message) = channel.on_fragment_received(ctx, kind, value) else {
            return;
        };
        tracing::debug!("Received {:?} from {} ({} bytes)", kind, channel.peer, message.payload.len());
        match kind {
            PayloadKind::Message => self.callback.on_message_received(message, role),
            PayloadKind::Data => self.callback.on_data_received(message, role),
        }
    }

    fn on_ack(&mut self, id: ChannelId, kind: PayloadKind, value: &[u8]) {
        let Some(ack) = Ack::from_bytes(value) else {
            tracing::warn!("Malformed {:?} ack ({} bytes)", kind, value.len());
            return;
        };
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        if channel.on_ack(ctx, kind, &ack) {
            self.finish_channel_send(id, kind);
        }
    }

    /// Acceptor: an initiator introduced itself
    fn on_connection_request(&mut self, id: ChannelId, value: &[u8]) {
        if self.ctx.role != Role::Acceptor {
            return;
        }
        let name = String::from_utf8_lossy(value).into_owned();
        let Some(channel) = self.channel(id) else {
            return;
        };
        if channel.state.connected || channel.request_announced {
            tracing::debug!("Duplicate connection request from {}", channel.peer);
            return;
        }
        if !is_valid_name(&name) {
            tracing::warn!("Connection request with invalid name from {}", channel.peer.device);
            self.drop_channel(id);
            return;
        }

        // A fresh request under a known name supersedes the stale session
        let stale = self
            .channels
            .iter()
            .find(|c| c.id != id && c.peer.name == name && c.state.is_announced())
            .map(|c| c.id);
        if let Some(stale) = stale {
            if let Some(peer) = self.drop_channel(stale) {
                tracing::info!("{} reconnected from scratch, dropping old session", peer);
                self.callback.on_disconnected(peer);
            }
        }

        let Some(channel) = self.channel(id) else {
            return;
        };
        channel.peer.name = name;
        channel.request_announced = true;
        let peer = channel.peer.clone();
        tracing::info!("📥 Connection request from {}", peer);
        self.callback.on_connection_request(peer);
    }

    /// Initiator: the acceptor answered our request
    fn on_connection_response(&mut self, id: ChannelId, value: &[u8]) {
        if self.ctx.role != Role::Initiator {
            return;
        }
        let Some(channel) = self.channel(id) else {
            return;
        };
        if channel.state.connected {
            return;
        }
        channel.timers.connection_complete.cancel();
        match value.split_first() {
            Some((&RESPONSE_ACCEPTED, name)) => {
                let name = String::from_utf8_lossy(name).into_owned();
                if is_valid_name(&name) {
                    channel.peer.name = name;
                }
                channel.state.connected = true;
                let peer = channel.peer.clone();
                tracing::info!("✅ Connected to {}", peer);
                self.callback.on_connection_success(peer, Role::Initiator);
            }
            _ => {
                if let Some(peer) = self.drop_channel(id) {
                    tracing::info!("{} rejected the connection", peer);
                    self.callback.on_connection_failed(peer, ConnectionFailure::Rejected);
                }
            }
        }
    }

    /// Acceptor: an initiator wants to resume a session over a new link
    fn on_resume_request(&mut self, incoming: ChannelId, value: &[u8]) {
        let name = String::from_utf8_lossy(value).into_owned();
        let Some(device) = self
            .channels
            .iter()
            .find(|c| c.id == incoming)
            .map(|c| c.peer.device.clone())
        else {
            return;
        };

        let target = self
            .channels
            .iter()
            .find(|c| c.state.is_announced() && c.peer.name == name)
            .or_else(|| {
                self.channels
                    .iter()
                    .find(|c| c.state.reconnecting && c.peer.device == device)
            })
            .map(|c| c.id);

        let Some(target) = target else {
            tracing::info!("Refusing to resume unknown session with {}", name);
            self.ctx.write(
                incoming,
                &device,
                Characteristic::ConnectionResumed,
                vec![RESPONSE_REJECTED],
                WritePurpose::ResumeRefused,
            );
            return;
        };
        if target != incoming {
            // The provisional channel is folded into the existing session
            self.remove_channel(incoming);
        }

        let local_name = self.local_name.clone();
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == target) else {
            return;
        };
        channel.peer.device = device.clone();
        channel.state.hardware_connected = true;
        let was_reconnecting = channel.state.reconnecting;
        if !was_reconnecting {
            // We never saw the link drop; whatever was on the air is gone
            channel.suspend_transmission();
        }
        channel.state.reconnecting = false;
        channel.state.requesting_reconnection = false;
        channel.timers.reconnection.cancel();
        channel.timers.connection_complete.cancel();

        let mut response = vec![RESPONSE_ACCEPTED];
        response.extend_from_slice(local_name.as_bytes());
        ctx.write(target, &device, Characteristic::ConnectionResumed, response, WritePurpose::Control);

        let renamed = (is_valid_name(&name) && channel.peer.name != name).then(|| channel.rename(&name));
        let peer = channel.peer.clone();
        channel.resume_transmission(ctx);

        tracing::info!("✅ Session with {} resumed", peer);
        if was_reconnecting {
            self.callback.on_connection_resumed(peer.clone());
        }
        if let Some(old) = renamed {
            self.callback.on_peer_updated(old, peer);
        }
    }

    /// Initiator: the acceptor answered our resume request
    fn on_resume_response(&mut self, id: ChannelId, value: &[u8]) {
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        if !channel.state.reconnecting {
            return;
        }
        match value.split_first() {
            Some((&RESPONSE_ACCEPTED, name)) => {
                let name = String::from_utf8_lossy(name).into_owned();
                channel.timers.connection_complete.cancel();
                channel.timers.reconnection.cancel();
                channel.state.reconnecting = false;
                channel.state.requesting_reconnection = false;
                let renamed = (is_valid_name(&name) && channel.peer.name != name).then(|| channel.rename(&name));
                let peer = channel.peer.clone();
                channel.resume_transmission(ctx);

                tracing::info!("✅ Session with {} resumed", peer);
                self.callback.on_connection_resumed(peer.clone());
                if let Some(old) = renamed {
                    self.callback.on_peer_updated(old, peer);
                }
            }
            _ => {
                tracing::info!("{} refused to resume", channel.peer);
                self.stop_reconnection(id);
            }
        }
    }

    fn on_name_update(&mut self, id: ChannelId, value: &[u8]) {
        let name = String::from_utf8_lossy(value).into_owned();
        let Some(channel) = self.channel(id) else {
            return;
        };
        if !channel.state.connected || channel.peer.name == name {
            return;
        }
        if !is_valid_name(&name) {
            tracing::warn!("Ignoring invalid name update from {}", channel.peer);
            return;
        }
        let old = channel.rename(&name);
        let new = channel.peer.clone();
        tracing::info!("Peer {} is now {}", old, new);
        self.callback.on_peer_updated(old, new);
    }

    /// The peer is closing the session
    fn on_disconnection_notice(&mut self, id: ChannelId) {
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        tracing::info!("{} is disconnecting", channel.peer);
        if channel.state.disconnecting {
            ctx.disconnect(&channel.peer.device);
            return;
        }
        channel.state.disconnecting = true;
        let aborted = channel.abort_sends();
        channel.timers.reconnection.cancel();
        ctx.disconnect(&channel.peer.device);
        ctx.start_timer(&mut channel.timers, id, TimerKind::Disconnection);
        for kind in aborted {
            self.finish_channel_send(id, kind);
        }
    }

    // ------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------

    fn disconnect_channel(&mut self, id: ChannelId) {
        let Some(channel) = self.channel(id) else {
            return;
        };
        if channel.state.disconnecting {
            return;
        }
        if channel.state.reconnecting || !channel.state.connected {
            // No session to notify: pending connect, handshake or resume window
            if let Some(peer) = self.drop_channel(id) {
                tracing::info!("Disconnected from {}", peer);
                self.callback.on_disconnected(peer);
            }
            return;
        }

        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        tracing::info!("Disconnecting from {}", channel.peer);
        channel.state.disconnecting = true;
        let aborted = channel.abort_sends();
        ctx.write(
            id,
            &channel.peer.device,
            Characteristic::Disconnection,
            Vec::new(),
            WritePurpose::DisconnectNotice,
        );
        ctx.start_timer(&mut channel.timers, id, TimerKind::NotifyDisconnection);
        for kind in aborted {
            self.finish_channel_send(id, kind);
        }
    }

    /// Notice delivered or given up on: take the link down
    fn force_disconnect(&mut self, id: ChannelId) {
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        channel.timers.notify_disconnection.cancel();
        ctx.disconnect(&channel.peer.device);
        ctx.start_timer(&mut channel.timers, id, TimerKind::Disconnection);
    }

    fn finish_disconnection(&mut self, id: ChannelId) {
        if let Some(peer) = self.remove_channel(id) {
            tracing::info!("Disconnected from {}", peer);
            self.callback.on_disconnected(peer);
        }
    }

    /// Give up on a session that could not be resumed
    fn stop_reconnection(&mut self, id: ChannelId) {
        if let Some(peer) = self.drop_channel(id) {
            tracing::warn!("Could not resume session with {}", peer);
            self.callback.on_disconnected(peer);
        }
    }

    // ------------------------------------------------------------------
    // Timers and write completions
    // ------------------------------------------------------------------

    fn handle_timer(&mut self, id: ChannelId, kind: TimerKind, generation: u64) {
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };
        if !channel.timers.get_mut(kind).fire(generation) {
            return;
        }
        tracing::debug!("⏱️  {:?} timer fired for {}", kind, channel.peer);

        match kind {
            TimerKind::ConnectionComplete => {
                if channel.state.reconnecting {
                    self.stop_reconnection(id);
                } else if !channel.state.connected {
                    self.handshake_failed(id);
                }
            }
            TimerKind::Reconnection => {
                if channel.state.reconnecting {
                    self.stop_reconnection(id);
                }
            }
            TimerKind::MessageAck => channel.on_ack_timeout(ctx, PayloadKind::Message),
            TimerKind::DataAck => channel.on_ack_timeout(ctx, PayloadKind::Data),
            TimerKind::NotifyDisconnection => {
                tracing::warn!("Disconnection notice to {} timed out", channel.peer);
                self.callback.on_disconnection_failed();
                self.force_disconnect(id);
            }
            TimerKind::Disconnection => self.finish_disconnection(id),
            TimerKind::Resume => channel.on_resume(ctx),
        }
    }

    fn handle_write_done(&mut self, id: ChannelId, purpose: WritePurpose, ok: bool) {
        let ctx = &self.ctx;
        let Some(channel) = self.channels.iter_mut().find(|c| c.id == id) else {
            return;
        };

        match purpose {
            WritePurpose::Fragment { kind, id: message_id, sequence } => {
                channel.on_fragment_written(ctx, kind, &message_id, &sequence, ok);
            }
            WritePurpose::Control => {}
            WritePurpose::NameExchange => {
                if !ok && !channel.state.connected {
                    self.handshake_failed(id);
                }
            }
            // A failed resume request is settled by the connection-complete timer
            WritePurpose::ResumeRequest => {}
            WritePurpose::Accept => {
                channel.answering = false;
                if channel.state.connected {
                    return;
                }
                if ok {
                    channel.timers.connection_complete.cancel();
                    channel.state.connected = true;
                    let peer = channel.peer.clone();
                    tracing::info!("✅ Accepted {}", peer);
                    self.callback.on_connection_success(peer, Role::Acceptor);
                } else if let Some(peer) = self.drop_channel(id) {
                    self.callback.on_connection_failed(peer, ConnectionFailure::Failed);
                }
            }
            WritePurpose::Reject => {
                if let Some(peer) = self.drop_channel(id) {
                    tracing::info!("Rejected {}", peer);
                }
            }
            WritePurpose::ResumeRefused => {
                self.drop_channel(id);
            }
            WritePurpose::DisconnectNotice => {
                if !channel.timers.notify_disconnection.is_running() {
                    return;
                }
                if !ok {
                    tracing::warn!("Could not notify {} of disconnection", channel.peer);
                    self.callback.on_disconnection_failed();
                }
                self.force_disconnect(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn destroy(&mut self) {
        tracing::info!("Destroying {} connection", self.ctx.role);
        for queue in [&mut self.message_sends, &mut self.data_sends] {
            for job in queue.active.take().into_iter().chain(queue.waiting.drain(..)) {
                let _ = job.reply.send(Err(LinkError::Destroyed));
            }
        }
        self.connect_queue.clear();
        if let Some(id) = self.connecting.take() {
            if let Some(channel) = self.channels.iter().find(|c| c.id == id) {
                if !channel.state.hardware_connected {
                    self.ctx.cancel_connect(&channel.peer.device);
                }
            }
        }
        for mut channel in std::mem::take(&mut self.channels) {
            channel.timers.cancel_all();
            if channel.state.hardware_connected {
                self.ctx.disconnect(&channel.peer.device);
            }
            if channel.state.is_announced() {
                self.callback.on_disconnected(channel.peer);
            }
        }
    }
}
