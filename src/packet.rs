//! Tunnel packet framing
//!
//! Every DNS exchange carries exactly one packet, in the query name on the way
//! up and in a TXT answer on the way down.
//!
//! Format: `[kind|flags:1][session_id:2][seq:2][ack:2][cookie:2][payload...]`
//!
//! All integers are big-endian. Bit 7 of the first octet says whether the
//! `ack` field is meaningful; the low 7 bits hold the [`PacketKind`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::num::NonZeroU16;
use thiserror::Error;

/// Fixed header size in octets
pub const PACKET_LEN: usize = 9;

const ACK_PRESENT: u8 = 0x80;
const KIND_MASK: u8 = 0x7f;

/// Reply payloads for refused requests
pub const ERR_AUTH_FAILED: &str = "Authentication failed";
pub const ERR_CONN_REFUSED: &str = "Connection refused";
pub const ERR_BAD_SESSION: &str = "Bad session id";
pub const ERR_EXHAUSTED: &str = "Too many sessions";
pub const ERR_BAD_REQUEST: &str = "Bad request";

/// Local framing failures. Never sent over the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Truncated packet header")]
    Truncated,

    #[error("Unknown packet type: {0:#04x}")]
    UnknownType(u8),

    #[error("Payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Session identifier multiplexing every tunnel over one UDP socket
///
/// Zero is reserved on the wire for "no session yet", so the id itself is
/// never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(NonZeroU16);

impl SessionId {
    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(Self)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.get())
    }
}

/// Request and reply kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Open a session (no id) or answer its challenge (with id)
    Login = 1,
    /// Ask the relay to connect or bind the resource in the payload
    Connect = 2,
    /// Ask whether the resource is connected yet
    Connected = 3,
    /// The local side of the tunnel is gone
    Disconnected = 4,
    /// One fragment of the byte stream
    Data = 5,
    /// Poll / keep-alive, or "not yet" in a reply
    Nop = 6,
    Ok = 7,
    /// Refusal, the payload is a short diagnostic
    Err = 8,
    /// Abort sequenced like data: the stream ends here
    Desauth = 9,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Login,
            2 => Self::Connect,
            3 => Self::Connected,
            4 => Self::Disconnected,
            5 => Self::Data,
            6 => Self::Nop,
            7 => Self::Ok,
            8 => Self::Err,
            9 => Self::Desauth,
            _ => return None,
        })
    }

    /// Kinds that occupy a sequence number
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::Data | Self::Desauth)
    }
}

/// One framed exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub session_id: Option<SessionId>,
    pub seq: u16,
    pub ack: Option<u16>,
    pub cookie: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, session_id: Option<SessionId>) -> Self {
        Self {
            kind,
            session_id,
            seq: 0,
            ack: None,
            cookie: 0,
            payload: Bytes::new(),
        }
    }

    pub fn with_seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_ack(mut self, ack: Option<u16>) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_cookie(mut self, cookie: u16) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// `Err` reply carrying a diagnostic
    pub fn error(session_id: Option<SessionId>, message: &str) -> Self {
        Self::new(PacketKind::Err, session_id).with_payload(message.as_bytes().to_vec())
    }

    /// Payload as text, for resource strings, challenges and errors
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Largest payload that fits in `budget` octets
    pub fn max_payload(budget: usize) -> usize {
        budget.saturating_sub(PACKET_LEN)
    }

    /// Serialize into at most `budget` octets
    pub fn encode(&self, budget: usize) -> Result<Vec<u8>, FrameError> {
        let max = Self::max_payload(budget);
        if self.payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max,
            });
        }

        let mut buf = BytesMut::with_capacity(PACKET_LEN + self.payload.len());
        let mut first = self.kind as u8;
        if self.ack.is_some() {
            first |= ACK_PRESENT;
        }
        buf.put_u8(first);
        buf.put_u16(self.session_id.map_or(0, SessionId::get));
        buf.put_u16(self.seq);
        buf.put_u16(self.ack.unwrap_or(0));
        buf.put_u16(self.cookie);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    /// Parse a decoded packet
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PACKET_LEN {
            return Err(FrameError::Truncated);
        }

        let mut buf = data;
        let first = buf.get_u8();
        let kind = PacketKind::from_u8(first & KIND_MASK)
            .ok_or(FrameError::UnknownType(first & KIND_MASK))?;
        let session_id = SessionId::new(buf.get_u16());
        let seq = buf.get_u16();
        let ack = buf.get_u16();
        let cookie = buf.get_u16();

        Ok(Self {
            kind,
            session_id,
            seq,
            ack: (first & ACK_PRESENT != 0).then_some(ack),
            cookie,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
