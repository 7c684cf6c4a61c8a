//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Packet`]: a fixed 20-byte
//! header followed by `length` payload bytes.  This module is responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission,
//!   including the RFC 1071 ones-complement checksum.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed, truncated, or corrupted input.
//!
//! All multi-byte fields are big-endian on the wire and converted to host
//! order here, in exactly one place.  The checksum exists only on the wire;
//! in-memory state never carries network-order values.
//!
//! No I/O happens here — this is pure data transformation.

use thiserror::Error;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 20;

/// Largest datagram this protocol will emit (header + payload).
///
/// Chosen to stay under a 1500-byte MTU once IP and UDP headers are added.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Largest payload a single segment may carry.
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_LEN;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish — sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
    /// Reset the connection.
    pub const RST: u8 = 0b0000_1000;
    /// Push buffered data to the application promptly.
    pub const PSH: u8 = 0b0001_0000;
}

/// Fixed-size protocol header.
///
/// Wire layout (network byte order):
///
/// ```text
///  0       4       8   9   10     12      16      20
///  ├─ seq ─┼─ ack ─┼fl─┼rsv┼─cksum─┼─ len ─┼─ wnd ─┤ payload…
/// ```
///
/// The checksum is computed on encode and verified-then-discarded on decode;
/// it is deliberately not part of the in-memory header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of the first payload byte (or of the SYN/FIN octet).
    pub seq: u32,
    /// Acknowledgement number: next byte expected from the peer (cumulative).
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Payload byte count, excluding the header.  Validated on parse.
    pub length: u32,
    /// Sender-advertised free receive-buffer space in bytes.
    pub window: u32,
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, keeping the header's `length` consistent with the
    /// payload.
    pub fn new(seq: u32, ack: u32, flags: u8, window: u32, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                length: payload.len() as u32,
                window,
            },
            payload,
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The header is laid out big-endian with a zeroed checksum field, the
    /// payload appended, and the checksum patched in last.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.seq.to_be_bytes());
        buf.extend_from_slice(&self.header.ack.to_be_bytes());
        buf.push(self.header.flags);
        buf.push(0); // reserved
        buf.extend_from_slice(&[0, 0]); // checksum, patched below
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.header.window.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        let ck = checksum(&buf);
        buf[10..12].copy_from_slice(&ck.to_be_bytes());
        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns `Err` if the buffer is too short, the checksum does not
    /// verify, or the `length` field disagrees with the actual payload size.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        // A datagram with a correct checksum sums to 0xFFFF when the stored
        // checksum participates in the sum.
        if fold_sum(buf) != 0xFFFF {
            return Err(PacketError::ChecksumFailed);
        }

        let seq = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let ack = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let flags = buf[8];
        let length = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let window = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);

        if buf.len() - HEADER_LEN != length as usize {
            return Err(PacketError::LengthMismatch);
        }

        Ok(Self {
            header: Header {
                seq,
                ack,
                flags,
                length,
                window,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("datagram shorter than the {HEADER_LEN}-byte header")]
    BufferTooShort,
    /// `length` field does not match the actual remaining bytes.
    #[error("length field disagrees with payload size")]
    LengthMismatch,
    /// Checksum did not match the recomputed value.
    #[error("checksum verification failed")]
    ChecksumFailed,
}

/// Ones-complement sum of `data` as 16-bit big-endian words (RFC 1071).
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
fn fold_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum += u32::from(u16::from_be_bytes([w[0], w[1]]));
    }
    if let &[last] = words.remainder() {
        sum += u32::from(last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum: the ones-complement of the ones-complement sum.
pub fn checksum(data: &[u8]) -> u16 {
    !fold_sum(data)
}
