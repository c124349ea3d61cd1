//! Application-level messages carried over a channel

use serde::{Deserialize, Serialize};

use super::peer::Peer;

/// Length of the application header prefixed to every payload
pub const MESSAGE_HEADER_LENGTH: usize = 2;

/// Header used for plain text messages
pub const TEXT_HEADER: &str = "00";

/// Logical message exchanged between peers
///
/// The header is an application-defined tag (for example the kind of
/// translation result carried); the link layer only transports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Set on received messages, `None` on outbound ones
    pub sender: Option<Peer>,
    pub header: String,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message. Headers are padded or cut to [`MESSAGE_HEADER_LENGTH`]
    /// ASCII characters.
    pub fn new(header: &str, payload: impl Into<Vec<u8>>) -> Self {
        let mut header: String = header
            .chars()
            .filter(|c| c.is_ascii() && !c.is_ascii_control())
            .take(MESSAGE_HEADER_LENGTH)
            .collect();
        while header.len() < MESSAGE_HEADER_LENGTH {
            header.push('0');
        }
        Self {
            sender: None,
            header,
            payload: payload.into(),
        }
    }

    /// Plain text message
    pub fn text(text: &str) -> Self {
        Self::new(TEXT_HEADER, text.as_bytes())
    }

    /// Payload decoded as UTF-8, lossily
    pub fn text_content(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Header followed by payload, as carried inside fragments
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MESSAGE_HEADER_LENGTH + self.payload.len());
        bytes.extend_from_slice(self.header.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Inverse of [`Message::to_bytes`]
    pub(crate) fn from_bytes(sender: Option<Peer>, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MESSAGE_HEADER_LENGTH {
            return None;
        }
        let (header, payload) = bytes.split_at(MESSAGE_HEADER_LENGTH);
        if !header.is_ascii() {
            return None;
        }
        Some(Self {
            sender,
            header: String::from_utf8_lossy(header).into_owned(),
            payload: payload.to_vec(),
        })
    }
}
