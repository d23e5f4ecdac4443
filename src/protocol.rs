//! Wire formats for media units and control messages
//!
//! ## Media unit
//!
//! ```text
//! ┌──────────┬─────────┬─────────┬──────────────────┬──────────────────────┐
//! │ Magic(2) │ Kind(1) │ Rsv(1)  │  Timestamp(8)    │  Payload (variable)  │
//! │  0x4D4D  │ 1=video │    0    │  u64 LE (µs)     │  opaque bytes        │
//! │          │ 2=audio │         │                  │                      │
//! └──────────┴─────────┴─────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! ## Control channel
//!
//! ```text
//! Initiator                         Acceptor
//!   │── CONNECT <port> [<addr>] ──────>│
//!   │<──────────────────── OK ─────────│
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::IpAddr;

use crate::constants::*;
use crate::error::ProtocolError;

/// Magic number for media unit identification
pub const UNIT_MAGIC: u16 = 0x4D4D;

/// Media unit header size in bytes
pub const UNIT_HEADER_SIZE: usize = 12;

/// The four channel ports derived from a base port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelSet {
    base_port: u16,
}

impl ChannelSet {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn text(&self) -> u16 {
        self.base_port + TEXT_PORT_OFFSET
    }

    pub fn video(&self) -> u16 {
        self.base_port + VIDEO_PORT_OFFSET
    }

    pub fn control(&self) -> u16 {
        self.base_port + CONTROL_PORT_OFFSET
    }

    pub fn audio(&self) -> u16 {
        self.base_port + AUDIO_PORT_OFFSET
    }
}

/// Media kind carried by a unit
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video = 0x01,
    Audio = 0x02,
}

impl TryFrom<u8> for MediaKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Video),
            0x02 => Ok(Self::Audio),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// Timestamped opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUnit {
    pub kind: MediaKind,

    /// Capture wall-clock time in microseconds
    pub timestamp_us: u64,

    pub payload: Bytes,
}

impl MediaUnit {
    pub fn new(kind: MediaKind, timestamp_us: u64, payload: Bytes) -> Self {
        Self {
            kind,
            timestamp_us,
            payload,
        }
    }

    /// Stamp a freshly captured payload with the current time
    pub fn captured(kind: MediaKind, payload: Bytes) -> Self {
        let timestamp_us = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self::new(kind, timestamp_us, payload)
    }

    /// Same unit with a different payload (e.g. after decoding)
    pub fn with_payload(&self, payload: Bytes) -> Self {
        Self::new(self.kind, self.timestamp_us, payload)
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(UNIT_HEADER_SIZE + self.payload.len());

        buf.put_u16_le(UNIT_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u8(0);
        buf.put_u64_le(self.timestamp_us);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    pub fn deserialize(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < UNIT_HEADER_SIZE {
            return Err(ProtocolError::TooShort(data.len()));
        }

        let magic = data.get_u16_le();
        if magic != UNIT_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        let kind = MediaKind::try_from(data.get_u8())?;
        let _reserved = data.get_u8();
        let timestamp_us = data.get_u64_le();

        Ok(Self {
            kind,
            timestamp_us,
            payload: data,
        })
    }
}

/// Control channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Pairing request carrying the sender's base port and, optionally, its address
    Connect {
        base_port: u16,
        address: Option<String>,
    },

    /// Pairing accepted
    Ok,

    /// Request rejected
    Err(String),
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut parts = text.split_whitespace();
        let command = parts.next().ok_or(ProtocolError::Empty)?;

        match command {
            "CONNECT" => {
                let port_text = parts
                    .next()
                    .ok_or_else(|| ProtocolError::InvalidPort(String::new()))?;
                let base_port = port_text
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::InvalidPort(port_text.to_string()))?;
                let address = parts.next().map(str::to_string);
                if let Some(extra) = parts.next() {
                    return Err(ProtocolError::UnexpectedArgument(extra.to_string()));
                }
                Ok(Self::Connect { base_port, address })
            }
            "OK" => Ok(Self::Ok),
            "ERR" => {
                let reason = text.trim_start()["ERR".len()..].trim().to_string();
                Ok(Self::Err(reason))
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect {
                base_port,
                address: Some(address),
            } => write!(f, "CONNECT {} {}", base_port, address),
            Self::Connect {
                base_port,
                address: None,
            } => write!(f, "CONNECT {}", base_port),
            Self::Ok => f.write_str("OK"),
            Self::Err(reason) => write!(f, "ERR {}", reason),
        }
    }
}

/// Text line as published on the text channel
pub fn format_text_message(base_port: u16, message: &str) -> String {
    format!("[{}]: {}", base_port, message)
}

/// Subscription preamble sent by a subscriber right after connecting
///
/// ```text
/// ┌────────────────┬──────────────────────────────────┐
/// │ Base port (2)  │ Announced host (0, 4 or 16)      │
/// │ u16 BE         │ IPv4/IPv6 octets, absent if none │
/// └────────────────┴──────────────────────────────────┘
/// ```
///
/// The host is the identity the subscriber goes by in the publisher's peer
/// registry. Without it the publisher uses the connection's source address.
pub fn subscription_preamble(base_port: u16, host: Option<IpAddr>) -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u16(base_port);
    match host {
        Some(IpAddr::V4(ip)) => buf.put_slice(&ip.octets()),
        Some(IpAddr::V6(ip)) => buf.put_slice(&ip.octets()),
        None => {}
    }
    buf.freeze()
}

/// Parse a subscription preamble into the base port and announced host
pub fn parse_subscription_preamble(frame: &[u8]) -> Option<(u16, Option<IpAddr>)> {
    if frame.len() < 2 {
        return None;
    }
    let (port, host) = frame.split_at(2);
    let base_port = u16::from_be_bytes([port[0], port[1]]);

    let host = match host.len() {
        0 => None,
        4 => {
            let octets: [u8; 4] = host.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = host.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => return None,
    };
    Some((base_port, host))
}
