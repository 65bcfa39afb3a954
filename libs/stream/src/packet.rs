//! Wire framing for stream datagrams.
//!
//! ```text
//!  0               4               8
//! +---------------+---------------+------------------+
//! |   target id   |   sender id   |   payload ...    |
//! +---------------+---------------+------------------+
//! ```
//!
//! Both ids are little-endian `u32`. A target id of 0 starts a new request.
//! A datagram of exactly 4 bytes is a pure ACK carrying only the target id.
//! Anything else shorter than the 8-byte header is malformed.

use crate::error::{Error, Result};

/// Size of the full header
pub const HEADER_LEN: usize = 8;

/// Size of a pure ACK
pub const ACK_LEN: usize = 4;

/// Largest datagram a UDP socket will send over IPv4
pub const MAX_DATAGRAM_LEN: usize = 65507;

/// Target id meaning "no correlation, this is a fresh request"
pub const NEW_REQUEST: u32 = 0;

/// Protocol control codes carried as a single-byte correlated payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    Rejected = 5,
    Acknowledged = 6,
}

impl ControlCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            5 => Some(ControlCode::Rejected),
            6 => Some(ControlCode::Acknowledged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub target_id: u32,
    pub sender_id: u32,
}

impl Header {
    pub fn new(target_id: u32, sender_id: u32) -> Self {
        Self {
            target_id,
            sender_id,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.target_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_id.to_le_bytes());
        buf
    }

    /// Header followed by payload, ready for the wire
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&self.encode());
        packet.extend_from_slice(payload);
        packet
    }
}

/// Build the 4-byte pure ACK for the given correlation id
pub fn encode_ack(target_id: u32) -> [u8; ACK_LEN] {
    target_id.to_le_bytes()
}

fn read_u32(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// A classified inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// 4 bytes: acknowledges the exchange `target_id`
    Ack { target_id: u32 },
    /// Header only, no payload
    Control { header: Header },
    /// Payload with target id 0
    Request { sender_id: u32, payload: &'a [u8] },
    /// Payload for a waiting correlation entry
    Correlated { header: Header, payload: &'a [u8] },
}

impl<'a> Datagram<'a> {
    pub fn decode(raw: &'a [u8]) -> Result<Self> {
        if raw.len() == ACK_LEN {
            return Ok(Datagram::Ack {
                target_id: read_u32(raw),
            });
        }
        if raw.len() < HEADER_LEN {
            return Err(Error::InvalidFrame(format!(
                "{} byte datagram is neither an ACK nor a full header",
                raw.len()
            )));
        }

        let header = Header::new(read_u32(&raw[0..4]), read_u32(&raw[4..8]));
        let payload = &raw[HEADER_LEN..];

        Ok(if payload.is_empty() {
            Datagram::Control { header }
        } else if header.target_id == NEW_REQUEST {
            Datagram::Request {
                sender_id: header.sender_id,
                payload,
            }
        } else {
            Datagram::Correlated { header, payload }
        })
    }

    /// The pure ACK the receiver owes the sender, if any
    ///
    /// Every datagram carrying a full header is echoed back with the
    /// sender's id so its retry loop can stop.
    pub fn echo_ack(&self) -> Option<[u8; ACK_LEN]> {
        match self {
            Datagram::Ack { .. } => None,
            Datagram::Control { header } | Datagram::Correlated { header, .. } => {
                Some(encode_ack(header.sender_id))
            }
            Datagram::Request { sender_id, .. } => Some(encode_ack(*sender_id)),
        }
    }
}

/// What a correlation entry receives from the listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Reject,
    Payload(Vec<u8>),
}

impl Delivery {
    /// Classify a correlated payload
    ///
    /// Only a payload of exactly one byte can be a control code; longer
    /// payloads are application data even when they start with 5 or 6.
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload {
            [byte] => match ControlCode::from_byte(*byte) {
                Some(ControlCode::Acknowledged) => Delivery::Ack,
                Some(ControlCode::Rejected) => Delivery::Reject,
                None => Delivery::Payload(payload.to_vec()),
            },
            _ => Delivery::Payload(payload.to_vec()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Delivery::Ack => "ack",
            Delivery::Reject => "reject",
            Delivery::Payload(_) => "payload",
        }
    }
}
