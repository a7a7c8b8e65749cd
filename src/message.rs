//! Wire framing (§3, §4.4): the fixed, packed, big-endian datagram header
//! and the in-memory [`Message`] record used on both the send and receive
//! paths. Grounded on `librecast_pvt.h::lc_message_head_t` and
//! `librecast.c::lc_msg_*`.

use std::net::Ipv6Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Built-in opcodes dispatched by the listener (§4.5). Unknown opcodes on
/// the wire are preserved as [`Opcode::Unknown`] and still reach the user
/// callback, matching the reference implementation's "ignored at the
/// dispatch table but still delivered" behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Data,
    Ping,
    Pong,
    Unknown(u8),
}

impl Opcode {
    pub const DATA: u8 = 0;
    pub const PING: u8 = 1;
    pub const PONG: u8 = 2;

    pub(crate) fn from_wire(b: u8) -> Self {
        match b {
            Self::DATA => Opcode::Data,
            Self::PING => Opcode::Ping,
            Self::PONG => Opcode::Pong,
            other => Opcode::Unknown(other),
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Opcode::Data => Self::DATA,
            Opcode::Ping => Self::PING,
            Opcode::Pong => Self::PONG,
            Opcode::Unknown(b) => b,
        }
    }
}

/// On-wire header: 64-bit timestamp, 64-bit sequence, 64-bit nonce, 8-bit
/// opcode, 64-bit length, all big-endian, followed immediately by the
/// payload. Encoded and decoded byte-by-byte below rather than transmuted
/// through a `repr(C)` struct, so there is no host padding/alignment to
/// reconcile with the C struct's `__attribute__((__packed__))` layout.
pub const HEADER_LEN: usize = 8 + 8 + 8 + 1 + 8;

pub(crate) struct Header {
    pub timestamp: u64,
    pub seq: u64,
    pub nonce: u64,
    pub op: u8,
    pub len: u64,
}

impl Header {
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..16].copy_from_slice(&self.seq.to_be_bytes());
        buf[16..24].copy_from_slice(&self.nonce.to_be_bytes());
        buf[24] = self.op;
        buf[25..33].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Header {
            timestamp: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            seq: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            nonce: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            op: buf[24],
            len: u64::from_be_bytes(buf[25..33].try_into().unwrap()),
        }
    }
}

/// One datagram, outbound or inbound (§3). Payload ownership is a plain
/// `Vec<u8>`; Rust's ownership model replaces the reference
/// implementation's explicit free-function/hint pair (§4 "Message
/// framing").
#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) data: Vec<u8>,
    pub(crate) op: Opcode,
    pub(crate) seq: u64,
    pub(crate) nonce: u64,
    pub(crate) timestamp: u64,
    pub(crate) src: Option<Ipv6Addr>,
    pub(crate) dst: Option<Ipv6Addr>,
    pub(crate) sock_id: u32,
    pub(crate) chan_id: Option<u32>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            data: Vec::new(),
            op: Opcode::Data,
            seq: 0,
            nonce: 0,
            timestamp: 0,
            src: None,
            dst: None,
            sock_id: 0,
            chan_id: None,
        }
    }
}

impl Message {
    /// `lc_msg_init`: a zeroed outgoing message.
    pub fn new() -> Self {
        Self::default()
    }

    /// `lc_msg_init_data`: wraps caller-owned bytes without copying.
    pub fn with_data(data: Vec<u8>, op: Opcode) -> Self {
        Message {
            data,
            op,
            ..Self::default()
        }
    }

    /// `lc_msg_init_size`: a zero-filled payload of `len` bytes, ready for
    /// the caller to write into before sending.
    pub fn with_capacity(len: usize) -> Self {
        Message {
            data: vec![0u8; len],
            ..Self::default()
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Reclaims the payload buffer, consuming the message.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn opcode(&self) -> Opcode {
        self.op
    }

    pub fn set_opcode(&mut self, op: Opcode) {
        self.op = op;
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn src_addr(&self) -> Option<Ipv6Addr> {
        self.src
    }

    pub fn dst_addr(&self) -> Option<Ipv6Addr> {
        self.dst
    }

    pub fn socket_id(&self) -> u32 {
        self.sock_id
    }

    pub fn channel_id(&self) -> Option<u32> {
        self.chan_id
    }

    /// `lc_msg_id`: a content identifier keyed-hashed over the payload and
    /// the source address, mirroring the reference implementation's use of
    /// the same hash primitive for message identity as for group
    /// derivation.
    pub fn id(&self) -> Result<[u8; crate::hash::DIGEST_LEN]> {
        let src = self.src.unwrap_or(Ipv6Addr::UNSPECIFIED);
        let mut input = Vec::with_capacity(self.data.len() + 16);
        input.extend_from_slice(&self.data);
        input.extend_from_slice(&src.octets());
        crate::hash::hash16(&input)
    }

}

/// Nanoseconds since the Unix epoch, the realtime clock §4.4 calls for.
pub(crate) fn now_nanos() -> Result<u64> {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::InvalidParams)?;
    Ok(dur.as_nanos() as u64)
}
