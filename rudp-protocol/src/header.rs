//! Ack header and datagram layout
//!
//! Every datagram starts with a single control byte:
//!
//! ```text
//!  7         6            5 .. 0
//! +---------+------------+-----------+
//! | use_ack | is_ack_pkt |  counter  |
//! +---------+------------+-----------+
//! ```
//!
//! A pure-ack datagram is exactly this byte. A data datagram is this byte
//! followed by the payload.

use crate::sequence::{Seq, WINDOW};
use thiserror::Error;

/// Size of the ack header in bytes
pub const HEADER_SIZE: usize = 1;

/// Maximum datagram size, header included
pub const MAX_DATAGRAM: usize = 1024;

/// Maximum payload carried by one datagram
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_SIZE;

const USE_ACK_BIT: u8 = 0x80;
const ACK_PACKET_BIT: u8 = 0x40;
const COUNTER_MASK: u8 = WINDOW - 1;

/// Datagram framing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Empty datagram")]
    Empty,

    #[error("Datagram too large: {0} bytes")]
    Oversized(usize),
}

/// Decoded control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    /// Datagram takes part in sequencing and retransmission
    pub use_ack: bool,
    /// Datagram is a pure acknowledgment
    pub is_ack_packet: bool,
    /// Sequence number (meaningless when `use_ack` is false)
    pub counter: Seq,
}

impl AckHeader {
    /// Header for an ordered, acknowledged data datagram
    pub fn data(seq: Seq) -> Self {
        AckHeader {
            use_ack: true,
            is_ack_packet: false,
            counter: seq,
        }
    }

    /// Header for an unordered, unacknowledged data datagram
    pub fn unordered() -> Self {
        AckHeader {
            use_ack: false,
            is_ack_packet: false,
            counter: Seq::default(),
        }
    }

    /// Header for a pure acknowledgment of `seq`
    pub fn ack(seq: Seq) -> Self {
        AckHeader {
            use_ack: true,
            is_ack_packet: true,
            counter: seq,
        }
    }

    /// Pack into the wire byte
    #[inline]
    pub fn encode(self) -> u8 {
        encode(self.use_ack, self.is_ack_packet, self.counter.as_raw())
    }

    /// Unpack from the wire byte
    #[inline]
    pub fn decode(byte: u8) -> Self {
        AckHeader {
            use_ack: byte & USE_ACK_BIT != 0,
            is_ack_packet: byte & ACK_PACKET_BIT != 0,
            counter: Seq::from(byte & COUNTER_MASK),
        }
    }
}

/// Pack the three header fields into one byte; `counter` is masked to 6 bits
#[inline]
pub fn encode(use_ack: bool, is_ack_packet: bool, counter: u8) -> u8 {
    ((use_ack as u8) << 7) | ((is_ack_packet as u8) << 6) | (counter & COUNTER_MASK)
}

/// A classified inbound datagram, borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// Pure acknowledgment for a sequence number
    Ack(Seq),
    /// Ordered data datagram
    Ordered { seq: Seq, payload: &'a [u8] },
    /// Unordered data datagram
    Unordered { payload: &'a [u8] },
}

impl<'a> Datagram<'a> {
    /// Decode the header byte and split off the payload
    pub fn parse(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        let (&first, payload) = bytes.split_first().ok_or(HeaderError::Empty)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(HeaderError::Oversized(bytes.len()));
        }

        let header = AckHeader::decode(first);
        Ok(match (header.use_ack, header.is_ack_packet) {
            (true, true) => Datagram::Ack(header.counter),
            (true, false) => Datagram::Ordered {
                seq: header.counter,
                payload,
            },
            (false, _) => Datagram::Unordered { payload },
        })
    }
}
