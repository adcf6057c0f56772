//! Neighbor-link wire framing
//!
//! Every message on a link is `[2-byte stream id][4-byte length][type][payload]`
//! where the length covers the type byte and the payload.

use crate::{Error, Result, StreamId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default cap on a single framed message
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 8 * 1024 * 1024;

/// Stream id plus length prefix
pub const FRAME_HEADER_LEN: usize = 6;

/// PARTIAL prefix inside a frame body: type byte plus remaining count
pub const PARTIAL_HEADER_LEN: usize = 5;

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Choke = 0x00,
    Unchoke = 0x01,
    Interested = 0x02,
    NotInterested = 0x03,
    Have = 0x04,
    Bitfield = 0x05,
    Request = 0x06,
    Piece = 0x07,
    Cancel = 0x08,
    TrackingCode = 0x09,
    Confirm = 0x0A,
    Encrypted = 0x0B,
    Relay = 0x0C,
    Break = 0x0D,
    AckBreak = 0x0E,
    Partial = 0x0F,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use MessageType::*;
        Some(match b {
            0x00 => Choke,
            0x01 => Unchoke,
            0x02 => Interested,
            0x03 => NotInterested,
            0x04 => Have,
            0x05 => Bitfield,
            0x06 => Request,
            0x07 => Piece,
            0x08 => Cancel,
            0x09 => TrackingCode,
            0x0A => Confirm,
            0x0B => Encrypted,
            0x0C => Relay,
            0x0D => Break,
            0x0E => AckBreak,
            0x0F => Partial,
            _ => return None,
        })
    }

    /// Codes that only ever travel inside an ENCRYPTED envelope
    pub fn is_transfer(self) -> bool {
        (self as u8) <= MessageType::Cancel as u8
    }

    /// Check a message body (type byte included) against the length table
    pub fn check_length(self, body_len: usize) -> Result<()> {
        use MessageType::*;
        let ok = match self {
            Choke | Unchoke | Interested | NotInterested | Confirm | Break | AckBreak => {
                body_len == 1
            }
            Have => body_len == 5,
            Request | Cancel => body_len == 13,
            Piece => body_len > 9,
            Bitfield | TrackingCode | Encrypted | Relay => body_len > 1,
            Partial => body_len > PARTIAL_HEADER_LEN,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{:?} message with bad length {}",
                self, body_len
            )))
        }
    }
}

/// One framed message as read off a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    /// Type byte followed by payload
    pub body: Bytes,
}

impl Frame {
    pub fn new(stream_id: StreamId, body: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.stream_id, &self.body)
    }
}

/// Encode a frame header and body into wire bytes
pub fn encode_frame(stream_id: StreamId, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.put_u16(stream_id);
    out.put_u32(body.len() as u32);
    out.extend_from_slice(body);
    out
}

/// Build a message body from a type code and payload
pub fn body(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(msg_type as u8);
    out.extend_from_slice(payload);
    out
}

/// Build a PARTIAL body carrying `fragment`, announcing `remaining` bytes of
/// the original message still to arrive (this fragment included)
pub fn partial_body(remaining: u32, fragment: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PARTIAL_HEADER_LEN + fragment.len());
    out.push(MessageType::Partial as u8);
    out.put_u32(remaining);
    out.extend_from_slice(fragment);
    out
}

/// Decoded network-layer message; transfer codes stay opaque at this level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TrackingCode(Bytes),
    Confirm,
    Encrypted(Bytes),
    /// Opaque body (type byte included) routed to the paired stream
    Relay(Bytes),
    Break,
    AckBreak,
    Partial { remaining: u32, fragment: Bytes },
    /// A transfer code outside any envelope
    Transfer(MessageType, Bytes),
    Unknown(u8),
}

impl Message {
    /// Classify a frame body, enforcing the length table
    pub fn parse(body: &Bytes) -> Result<Self> {
        let Some(&code) = body.first() else {
            return Err(Error::Protocol("empty message body".to_string()));
        };
        let Some(msg_type) = MessageType::from_byte(code) else {
            return Ok(Message::Unknown(code));
        };
        msg_type.check_length(body.len())?;
        let payload = body.slice(1..);
        Ok(match msg_type {
            MessageType::TrackingCode => Message::TrackingCode(payload),
            MessageType::Confirm => Message::Confirm,
            MessageType::Encrypted => Message::Encrypted(payload),
            MessageType::Relay => Message::Relay(payload),
            MessageType::Break => Message::Break,
            MessageType::AckBreak => Message::AckBreak,
            MessageType::Partial => {
                let mut header = &payload[..4];
                Message::Partial {
                    remaining: header.get_u32(),
                    fragment: payload.slice(4..),
                }
            }
            other => Message::Transfer(other, payload),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::TrackingCode(_) => "TCODE",
            Message::Confirm => "CONFIRM",
            Message::Encrypted(_) => "ENCRYPTED",
            Message::Relay(_) => "RELAY",
            Message::Break => "BREAK",
            Message::AckBreak => "ACKBREAK",
            Message::Partial { .. } => "PARTIAL",
            Message::Transfer(..) => "TRANSFER",
            Message::Unknown(_) => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Body { stream_id: StreamId, len: usize },
}

/// Incremental frame decoder.
///
/// Bytes are pushed in with [`FrameReader::feed`] as they arrive; each
/// complete frame is returned once its last byte is in. A length prefix above
/// the cap fails immediately, before any of the body is buffered.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    state: ReadState,
    max_len: usize,
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: ReadState::Header,
            max_len,
        }
    }

    /// Number of bytes needed before the next state transition
    pub fn next_expected_len(&self) -> usize {
        let want = match self.state {
            ReadState::Header => FRAME_HEADER_LEN,
            ReadState::Body { len, .. } => len,
        };
        want.saturating_sub(self.buf.len())
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.state {
                ReadState::Header => {
                    if self.buf.len() < FRAME_HEADER_LEN {
                        break;
                    }
                    let stream_id = self.buf.get_u16();
                    let len = self.buf.get_u32() as usize;
                    if len > self.max_len {
                        return Err(Error::Oversize {
                            len,
                            max: self.max_len,
                        });
                    }
                    if len == 0 {
                        return Err(Error::Protocol("zero-length frame".to_string()));
                    }
                    self.state = ReadState::Body { stream_id, len };
                }
                ReadState::Body { stream_id, len } => {
                    if self.buf.len() < len {
                        break;
                    }
                    let body = self.buf.split_to(len).freeze();
                    frames.push(Frame { stream_id, body });
                    self.state = ReadState::Header;
                }
            }
        }
        Ok(frames)
    }
}
