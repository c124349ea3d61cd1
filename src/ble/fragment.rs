//! Message Fragmentation and Reassembly
//!
//! Splits application messages into MTU-sized wire fragments and rebuilds them
//! on the receiving side.
//!
//! Wire layout of a fragment:
//!
//! ```text
//! [id: 4 chars][sequence: 3 chars][type: 1 char][payload bytes]
//! ```

use std::collections::VecDeque;

use super::message::Message;
use super::peer::Peer;
use super::sequence::{SequenceNumber, ID_LENGTH, SEQUENCE_LENGTH};
use crate::LinkError;

/// Length of the fragment header
pub const WIRE_HEADER_LENGTH: usize = ID_LENGTH + SEQUENCE_LENGTH + 1;

const NON_FINAL_CHAR: u8 = b'0';
const FINAL_CHAR: u8 = b'1';

/// Whether more fragments of the same message follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentType {
    NonFinal,
    Final,
}

impl FragmentType {
    fn as_byte(self) -> u8 {
        match self {
            FragmentType::NonFinal => NON_FINAL_CHAR,
            FragmentType::Final => FINAL_CHAR,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            NON_FINAL_CHAR => Some(FragmentType::NonFinal),
            FINAL_CHAR => Some(FragmentType::Final),
            _ => None,
        }
    }
}

/// One fragment of a logical message, or an accumulation of fragments
///
/// Two fragments are equal when they share sender and id, whatever their
/// sequence numbers, so every piece of one logical message compares equal.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub sender: Option<Peer>,
    pub id: SequenceNumber,
    pub sequence: SequenceNumber,
    pub fragment_type: FragmentType,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Parse a raw fragment. `None` if the header is short or malformed.
    pub fn create_from_bytes(sender: Option<Peer>, raw: &[u8]) -> Option<Self> {
        if raw.len() < WIRE_HEADER_LENGTH {
            return None;
        }
        let id = SequenceNumber::from_bytes(&raw[..ID_LENGTH])?;
        let sequence = SequenceNumber::from_bytes(&raw[ID_LENGTH..ID_LENGTH + SEQUENCE_LENGTH])?;
        let fragment_type = FragmentType::from_byte(raw[WIRE_HEADER_LENGTH - 1])?;
        Some(Self {
            sender,
            id,
            sequence,
            fragment_type,
            payload: raw[WIRE_HEADER_LENGTH..].to_vec(),
        })
    }

    /// Header plus payload, ready for the transport
    pub fn complete_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(WIRE_HEADER_LENGTH + self.payload.len());
        bytes.extend_from_slice(&self.id.as_bytes());
        bytes.extend_from_slice(&self.sequence.as_bytes());
        bytes.push(self.fragment_type.as_byte());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn is_final(&self) -> bool {
        self.fragment_type == FragmentType::Final
    }

    /// Append the next fragment of the same message.
    ///
    /// Only merges when `other` belongs to this message and its sequence number
    /// is strictly greater; the stored sequence and type then follow `other`.
    /// Returns whether the merge happened.
    pub fn add_message(&mut self, other: &WireMessage) -> bool {
        if *self != *other || other.sequence <= self.sequence {
            return false;
        }
        self.payload.extend_from_slice(&other.payload);
        self.sequence = other.sequence.clone();
        self.fragment_type = other.fragment_type;
        true
    }

    /// Rebuild the logical message once the final fragment has been merged
    pub fn convert_in_message(&self) -> Option<Message> {
        if !self.is_final() {
            return None;
        }
        Message::from_bytes(self.sender.clone(), &self.payload)
    }
}

impl PartialEq for WireMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sender == other.sender && self.id == other.id
    }
}

impl Eq for WireMessage {}

/// Split a message into fragments of at most `max_fragment_size` bytes each.
///
/// Sequence numbers start at the minimum value; only the last fragment is
/// final. Fails when the message would exhaust the sequence space.
pub fn split(
    message: &Message,
    id: &SequenceNumber,
    max_fragment_size: usize,
) -> Result<VecDeque<WireMessage>, LinkError> {
    let bytes = message.to_bytes();
    let max_data = max_fragment_size.saturating_sub(WIRE_HEADER_LENGTH).max(1);
    let chunks: Vec<&[u8]> = bytes.chunks(max_data).collect();

    let capacity = super::sequence::ALPHABET.len().pow(SEQUENCE_LENGTH as u32);
    if chunks.len() > capacity {
        return Err(LinkError::MessageTooLarge(bytes.len()));
    }

    tracing::debug!(
        "Fragmenting message {}: {} bytes → {} fragments ({} bytes/fragment)",
        id,
        bytes.len(),
        chunks.len(),
        max_data
    );

    let last = chunks.len() - 1;
    let mut sequence = SequenceNumber::new(SEQUENCE_LENGTH);
    let mut fragments = VecDeque::with_capacity(chunks.len());
    for (index, chunk) in chunks.into_iter().enumerate() {
        let fragment_type = if index == last {
            FragmentType::Final
        } else {
            FragmentType::NonFinal
        };
        fragments.push_back(WireMessage {
            sender: None,
            id: id.clone(),
            sequence: sequence.clone(),
            fragment_type,
            payload: chunk.to_vec(),
        });
        sequence.increment();
    }
    Ok(fragments)
}
