//! Fixed-width sequence numbers over the transmittable alphabet
//!
//! Fragment ids and intra-message sequence numbers travel as characters, not raw
//! binary, so every digit is drawn from a restricted alphabet whose members are
//! each a single byte on the wire.

use std::cmp::Ordering;
use std::fmt;

/// Printable ASCII, `' '` through `'~'`, in wire order.
pub const ALPHABET: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Width of the id that identifies a logical message
pub const ID_LENGTH: usize = 4;

/// Width of the sequence number of a fragment within its message
pub const SEQUENCE_LENGTH: usize = 3;

/// Check whether a byte belongs to the transmittable alphabet
pub fn is_transmittable(byte: u8) -> bool {
    ALPHABET.contains(&byte)
}

/// Odometer-style counter over an alphabet
///
/// Digits are stored as alphabet indices, most significant first. Incrementing
/// past the maximum is a no-op; [`SequenceNumber::is_max`] detects that state.
#[derive(Clone, Debug)]
pub struct SequenceNumber {
    alphabet: &'static [u8],
    digits: Vec<usize>,
}

impl SequenceNumber {
    /// Minimum value of the given width over [`ALPHABET`]
    pub fn new(len: usize) -> Self {
        Self::with_alphabet(ALPHABET, len)
    }

    /// Minimum value of the given width over a custom alphabet
    pub fn with_alphabet(alphabet: &'static [u8], len: usize) -> Self {
        Self {
            alphabet,
            digits: vec![0; len],
        }
    }

    /// Decode from wire characters, rejecting anything outside [`ALPHABET`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let digits = bytes
            .iter()
            .map(|b| ALPHABET.iter().position(|a| a == b))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            alphabet: ALPHABET,
            digits,
        })
    }

    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    /// Advance by one, carrying leftwards. Saturates at the maximum.
    pub fn increment(&mut self) {
        if self.digits.iter().all(|d| *d == self.alphabet.len() - 1) {
            return;
        }
        for digit in self.digits.iter_mut().rev() {
            if *digit + 1 < self.alphabet.len() {
                *digit += 1;
                return;
            }
            *digit = 0;
        }
    }

    /// True once incrementing no longer changes the value
    pub fn is_max(&self) -> bool {
        let mut next = self.clone();
        next.increment();
        next == *self
    }

    /// Wire representation, one byte per digit
    pub fn as_bytes(&self) -> Vec<u8> {
        self.digits.iter().map(|d| self.alphabet[*d]).collect()
    }
}

impl PartialEq for SequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SequenceNumber {}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        // Widths always match in practice; a shorter value sorts first otherwise.
        self.digits
            .len()
            .cmp(&other.digits.len())
            .then_with(|| self.digits.cmp(&other.digits))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.as_bytes()))
    }
}
