//! Per-peer protocol session
//!
//! A channel owns everything about one peer's session: outbound fragment lanes,
//! inbound reassembly, the receive history used for deduplication, and its
//! timers. It never blocks; every wait is a timer or a write completion that
//! comes back through the connection's inbox.

use std::collections::VecDeque;

use super::adapter::Characteristic;
use super::connection::{ChannelId, LinkContext, WritePurpose};
use super::fragment::{split, WireMessage};
use super::message::Message;
use super::peer::{LinkState, Peer};
use super::sequence::{SequenceNumber, ID_LENGTH, SEQUENCE_LENGTH};
use super::timer::{ChannelTimers, TimerKind};
use crate::LinkError;

const ACK_LENGTH: usize = ID_LENGTH + SEQUENCE_LENGTH + 1;
const ACK_SUCCESS: u8 = b'1';
const ACK_FAILURE: u8 = b'0';

/// The two independent streams of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Regular application messages
    Message,
    /// Out-of-band data
    Data,
}

impl PayloadKind {
    pub fn send_characteristic(self) -> Characteristic {
        match self {
            PayloadKind::Message => Characteristic::MessageSend,
            PayloadKind::Data => Characteristic::DataSend,
        }
    }

    pub fn ack_characteristic(self) -> Characteristic {
        match self {
            PayloadKind::Message => Characteristic::MessageAck,
            PayloadKind::Data => Characteristic::DataAck,
        }
    }

    pub fn ack_timer(self) -> TimerKind {
        match self {
            PayloadKind::Message => TimerKind::MessageAck,
            PayloadKind::Data => TimerKind::DataAck,
        }
    }
}

/// Acknowledgement of one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub id: SequenceNumber,
    pub sequence: SequenceNumber,
    pub success: bool,
}

impl Ack {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ACK_LENGTH);
        bytes.extend_from_slice(&self.id.as_bytes());
        bytes.extend_from_slice(&self.sequence.as_bytes());
        bytes.push(if self.success { ACK_SUCCESS } else { ACK_FAILURE });
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ACK_LENGTH {
            return None;
        }
        let success = match bytes[ACK_LENGTH - 1] {
            ACK_SUCCESS => true,
            ACK_FAILURE => false,
            _ => return None,
        };
        Some(Self {
            id: SequenceNumber::from_bytes(&bytes[..ID_LENGTH])?,
            sequence: SequenceNumber::from_bytes(&bytes[ID_LENGTH..ID_LENGTH + SEQUENCE_LENGTH])?,
            success,
        })
    }
}

/// Outbound stream: one logical message at a time, one fragment on the air
#[derive(Debug)]
struct OutboundLane {
    next_id: SequenceNumber,
    queue: VecDeque<WireMessage>,
    /// Front fragment has been written and awaits its ack
    in_flight: bool,
}

impl OutboundLane {
    fn new() -> Self {
        Self {
            next_id: SequenceNumber::new(ID_LENGTH),
            queue: VecDeque::new(),
            in_flight: false,
        }
    }

    fn is_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    fn front_matches(&self, id: &SequenceNumber, sequence: &SequenceNumber) -> bool {
        self.queue
            .front()
            .map(|f| f.id == *id && f.sequence == *sequence)
            .unwrap_or(false)
    }

    /// Fragment under the current id, then advance the id right away
    fn enqueue(&mut self, message: &Message, max_fragment_size: usize) -> Result<(), LinkError> {
        self.queue = split(message, &self.next_id, max_fragment_size)?;
        self.in_flight = false;
        if self.next_id.is_max() {
            self.next_id = SequenceNumber::new(ID_LENGTH);
        } else {
            self.next_id.increment();
        }
        Ok(())
    }

    fn clear(&mut self) -> bool {
        let was_pending = self.is_pending();
        self.queue.clear();
        self.in_flight = false;
        was_pending
    }
}

/// Inbound stream: reassembly accumulators plus bounded history of completed ids
#[derive(Debug)]
struct InboundLane {
    assembling: Vec<WireMessage>,
    completed: VecDeque<SequenceNumber>,
    capacity: usize,
}

impl InboundLane {
    fn new(capacity: usize) -> Self {
        Self {
            assembling: Vec::new(),
            completed: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn remember(&mut self, id: SequenceNumber) {
        if id.is_max() {
            // Sender wraps to the minimum id after this one
            self.completed.clear();
        }
        if self.completed.len() == self.capacity {
            self.completed.pop_front();
        }
        self.completed.push_back(id);
    }

    /// Feed one fragment; returns the message when it completes
    fn accept(&mut self, fragment: WireMessage) -> Option<Message> {
        if self.completed.contains(&fragment.id) {
            tracing::debug!("Dropping fragment of already received message {}", fragment.id);
            return None;
        }

        let accumulated = match self.assembling.iter().position(|m| *m == fragment) {
            Some(index) => {
                if !self.assembling[index].add_message(&fragment) {
                    tracing::debug!(
                        "Dropping duplicate fragment {}/{}",
                        fragment.id,
                        fragment.sequence
                    );
                    return None;
                }
                if !self.assembling[index].is_final() {
                    return None;
                }
                self.assembling.swap_remove(index)
            }
            None => {
                if fragment.sequence != SequenceNumber::new(SEQUENCE_LENGTH) {
                    tracing::warn!(
                        "Dropping fragment {}/{} without a message start",
                        fragment.id,
                        fragment.sequence
                    );
                    return None;
                }
                if !fragment.is_final() {
                    self.assembling.push(fragment);
                    return None;
                }
                fragment
            }
        };

        let id = accumulated.id.clone();
        match accumulated.convert_in_message() {
            Some(message) => {
                self.remember(id);
                Some(message)
            }
            None => {
                tracing::warn!("Discarding corrupt message {}", id);
                self.remember(id);
                None
            }
        }
    }

    fn rename_sender(&mut self, peer: &Peer) {
        for message in &mut self.assembling {
            message.sender = Some(peer.clone());
        }
    }
}

/// Session with one peer
pub(crate) struct Channel {
    pub id: ChannelId,
    pub peer: Peer,
    pub state: LinkState,
    /// Acceptor: the application has been asked to accept or reject
    pub request_announced: bool,
    /// Acceptor: an accept/reject answer is being written
    pub answering: bool,
    /// Acceptor: the application turned the request down
    pub rejected: bool,
    pub timers: ChannelTimers,
    message_out: OutboundLane,
    data_out: OutboundLane,
    message_in: InboundLane,
    data_in: InboundLane,
    /// Inbound burst in progress; hold outbound fragments
    paused: bool,
}

impl Channel {
    pub fn new(id: ChannelId, peer: Peer, history_capacity: usize) -> Self {
        Self {
            id,
            peer,
            state: LinkState::default(),
            request_announced: false,
            answering: false,
            rejected: false,
            timers: ChannelTimers::default(),
            message_out: OutboundLane::new(),
            data_out: OutboundLane::new(),
            message_in: InboundLane::new(history_capacity),
            data_in: InboundLane::new(history_capacity),
            paused: false,
        }
    }

    fn outbound(&mut self, kind: PayloadKind) -> &mut OutboundLane {
        match kind {
            PayloadKind::Message => &mut self.message_out,
            PayloadKind::Data => &mut self.data_out,
        }
    }

    fn inbound(&mut self, kind: PayloadKind) -> &mut InboundLane {
        match kind {
            PayloadKind::Message => &mut self.message_in,
            PayloadKind::Data => &mut self.data_in,
        }
    }

    pub fn is_sending(&self, kind: PayloadKind) -> bool {
        match kind {
            PayloadKind::Message => self.message_out.is_pending(),
            PayloadKind::Data => self.data_out.is_pending(),
        }
    }

    /// Start sending a message. Fails if one of this kind is still in flight.
    pub fn write(&mut self, ctx: &LinkContext, kind: PayloadKind, message: &Message) -> Result<(), LinkError> {
        if self.is_sending(kind) {
            return Err(LinkError::InvalidState(format!(
                "{:?} send already in flight to {}",
                kind, self.peer
            )));
        }
        let max_fragment_size = ctx.config.max_fragment_size;
        self.outbound(kind).enqueue(message, max_fragment_size)?;
        let fragments = self.outbound(kind).queue.len();
        tracing::debug!("Queued {:?} for {} in {} fragments", kind, self.peer, fragments);
        self.pump(ctx, kind);
        Ok(())
    }

    /// Put the front fragment on the air if nothing else is
    fn pump(&mut self, ctx: &LinkContext, kind: PayloadKind) {
        if self.paused || !self.state.can_transmit() {
            return;
        }
        let (channel, device) = (self.id, self.peer.device.clone());
        let lane = self.outbound(kind);
        if lane.in_flight {
            return;
        }
        let Some(fragment) = lane.queue.front() else {
            return;
        };
        lane.in_flight = true;
        let purpose = WritePurpose::Fragment {
            kind,
            id: fragment.id.clone(),
            sequence: fragment.sequence.clone(),
        };
        let bytes = fragment.complete_data();
        tracing::trace!("→ {:?} fragment {}", kind, hex::encode(&bytes));
        ctx.write(channel, &device, kind.send_characteristic(), bytes, purpose);
    }

    /// The transport finished writing a fragment; wait for its ack
    pub fn on_fragment_written(
        &mut self,
        ctx: &LinkContext,
        kind: PayloadKind,
        id: &SequenceNumber,
        sequence: &SequenceNumber,
        ok: bool,
    ) {
        let lane = self.outbound(kind);
        if !lane.in_flight || !lane.front_matches(id, sequence) {
            // Already acked, or superseded by a disconnection
            return;
        }
        if !ok {
            tracing::warn!("Write of fragment {}/{} to {} failed", id, sequence, self.peer);
        }
        ctx.start_timer(&mut self.timers, self.id, kind.ack_timer());
    }

    /// Handle an ack. Returns true when it completed the whole message.
    pub fn on_ack(&mut self, ctx: &LinkContext, kind: PayloadKind, ack: &Ack) -> bool {
        if !self.outbound(kind).front_matches(&ack.id, &ack.sequence) {
            tracing::debug!("Ignoring stale ack {}/{} from {}", ack.id, ack.sequence, self.peer);
            return false;
        }
        self.timers.get_mut(kind.ack_timer()).cancel();

        let lane = self.outbound(kind);
        lane.in_flight = false;
        if !ack.success {
            tracing::warn!("Peer refused fragment {}/{}, retransmitting", ack.id, ack.sequence);
            self.pump(ctx, kind);
            return false;
        }

        let finished = lane.queue.pop_front().map(|f| f.is_final()).unwrap_or(false);
        if finished {
            tracing::debug!("✅ {:?} {} delivered to {}", kind, ack.id, self.peer);
            return true;
        }
        self.pump(ctx, kind);
        false
    }

    /// No ack in time: send the same fragment again
    pub fn on_ack_timeout(&mut self, ctx: &LinkContext, kind: PayloadKind) {
        let peer = self.peer.clone();
        let lane = self.outbound(kind);
        if !lane.is_pending() {
            return;
        }
        lane.in_flight = false;
        if let Some(fragment) = lane.queue.front() {
            tracing::warn!(
                "⏱️  Ack timeout for {:?} fragment {}/{} to {}, retransmitting",
                kind,
                fragment.id,
                fragment.sequence,
                peer
            );
        }
        self.pump(ctx, kind);
    }

    /// Handle an inbound fragment: ack it, then reassemble
    pub fn on_fragment_received(&mut self, ctx: &LinkContext, kind: PayloadKind, raw: &[u8]) -> Option<Message> {
        let Some(fragment) = WireMessage::create_from_bytes(Some(self.peer.clone()), raw) else {
            tracing::warn!("Malformed {:?} fragment from {} ({} bytes)", kind, self.peer, raw.len());
            return None;
        };
        tracing::trace!("← {:?} fragment {}", kind, hex::encode(raw));

        let ack = Ack {
            id: fragment.id.clone(),
            sequence: fragment.sequence.clone(),
            success: true,
        };
        ctx.write(
            self.id,
            &self.peer.device,
            kind.ack_characteristic(),
            ack.to_bytes(),
            WritePurpose::Control,
        );

        // Hold our own fragments during an inbound burst, unless one is already on the air
        if !fragment.is_final() && !self.message_out.in_flight && !self.data_out.in_flight {
            self.paused = true;
        }
        if self.paused {
            ctx.start_timer(&mut self.timers, self.id, TimerKind::Resume);
        }

        self.inbound(kind).accept(fragment)
    }

    /// Resume delay elapsed
    pub fn on_resume(&mut self, ctx: &LinkContext) {
        self.paused = false;
        self.pump(ctx, PayloadKind::Message);
        self.pump(ctx, PayloadKind::Data);
    }

    /// Link lost: forget what was on the air, keep what is queued
    pub fn suspend_transmission(&mut self) {
        self.message_out.in_flight = false;
        self.data_out.in_flight = false;
        self.timers.message_ack.cancel();
        self.timers.data_ack.cancel();
        self.timers.resume.cancel();
        self.paused = false;
    }

    /// Link back: retransmit the front fragment of each lane
    pub fn resume_transmission(&mut self, ctx: &LinkContext) {
        self.pump(ctx, PayloadKind::Message);
        self.pump(ctx, PayloadKind::Data);
    }

    /// Drop queued sends. Returns the kinds that had one in flight.
    pub fn abort_sends(&mut self) -> Vec<PayloadKind> {
        let mut aborted = Vec::new();
        if self.message_out.clear() {
            aborted.push(PayloadKind::Message);
        }
        if self.data_out.clear() {
            aborted.push(PayloadKind::Data);
        }
        self.timers.message_ack.cancel();
        self.timers.data_ack.cancel();
        self.timers.resume.cancel();
        self.paused = false;
        aborted
    }

    /// Swap the peer's name, keeping in-progress reassembly attributed
    pub fn rename(&mut self, name: &str) -> Peer {
        let old = self.peer.clone();
        self.peer.name = name.to_string();
        let peer = self.peer.clone();
        self.message_in.rename_sender(&peer);
        self.data_in.rename_sender(&peer);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fragment::FragmentType;
    use crate::ble::peer::DeviceAddress;

    fn peer() -> Peer {
        Peer::new("bob", DeviceAddress::new("bb"))
    }

    fn fragments(text_len: usize, id: &SequenceNumber) -> VecDeque<WireMessage> {
        let mut fragments = split(&Message::new("00", vec![b'x'; text_len]), id, 20).unwrap();
        for fragment in &mut fragments {
            fragment.sender = Some(peer());
        }
        fragments
    }

    #[test]
    fn test_ack_roundtrip_and_rejects_garbage() {
        let ack = Ack {
            id: SequenceNumber::new(ID_LENGTH),
            sequence: SequenceNumber::new(SEQUENCE_LENGTH),
            success: false,
        };
        assert_eq!(Ack::from_bytes(&ack.to_bytes()), Some(ack));
        assert!(Ack::from_bytes(b"short").is_none());
        assert!(Ack::from_bytes(b"       x").is_none());
    }

    #[test]
    fn test_inbound_reassembles_once() {
        let mut lane = InboundLane::new(8);
        let parts = fragments(30, &SequenceNumber::new(ID_LENGTH));
        assert_eq!(parts.len(), 3);

        assert!(lane.accept(parts[0].clone()).is_none());
        assert!(lane.accept(parts[0].clone()).is_none(), "retransmitted first fragment");
        assert!(lane.accept(parts[1].clone()).is_none());
        let message = lane.accept(parts[2].clone()).unwrap();
        assert_eq!(message.payload.len(), 30);
        assert_eq!(message.sender, Some(peer()));

        // Retransmitted final fragment after completion
        assert!(lane.accept(parts[2].clone()).is_none());
        assert!(lane.assembling.is_empty());
    }

    #[test]
    fn test_inbound_drops_orphan_fragment() {
        let mut lane = InboundLane::new(8);
        let parts = fragments(30, &SequenceNumber::new(ID_LENGTH));
        assert!(lane.accept(parts[1].clone()).is_none());
        assert!(lane.assembling.is_empty());
    }

    #[test]
    fn test_history_is_bounded_and_resets_at_max_id() {
        let mut lane = InboundLane::new(2);
        let mut id = SequenceNumber::new(ID_LENGTH);
        for _ in 0..3 {
            lane.remember(id.clone());
            id.increment();
        }
        assert_eq!(lane.completed.len(), 2);
        assert!(!lane.completed.contains(&SequenceNumber::new(ID_LENGTH)));

        let max = SequenceNumber::from_bytes(b"~~~~").unwrap();
        assert!(max.is_max());
        lane.remember(max.clone());
        assert_eq!(lane.completed.len(), 1);
        assert!(lane.completed.contains(&max));
    }

    #[test]
    fn test_outbound_id_advances_and_wraps() {
        let mut lane = OutboundLane::new();
        lane.enqueue(&Message::text("one"), 180).unwrap();
        assert_eq!(lane.queue[0].id, SequenceNumber::new(ID_LENGTH));
        assert_eq!(lane.queue[0].fragment_type, FragmentType::Final);

        let mut expected = SequenceNumber::new(ID_LENGTH);
        expected.increment();
        assert_eq!(lane.next_id, expected);

        lane.next_id = SequenceNumber::from_bytes(b"~~~~").unwrap();
        lane.enqueue(&Message::text("two"), 180).unwrap();
        assert_eq!(lane.next_id, SequenceNumber::new(ID_LENGTH));
    }
}
