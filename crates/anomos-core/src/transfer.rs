//! File-transfer sub-protocol spoken between endpoints
//!
//! These messages never appear bare on a link: the endpoint wraps each one in
//! an ENCRYPTED envelope under the per-stream key.

use crate::wire::MessageType;
use crate::{Error, Result};
use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl TransferMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            TransferMessage::Choke => MessageType::Choke,
            TransferMessage::Unchoke => MessageType::Unchoke,
            TransferMessage::Interested => MessageType::Interested,
            TransferMessage::NotInterested => MessageType::NotInterested,
            TransferMessage::Have(_) => MessageType::Have,
            TransferMessage::Bitfield(_) => MessageType::Bitfield,
            TransferMessage::Request { .. } => MessageType::Request,
            TransferMessage::Piece { .. } => MessageType::Piece,
            TransferMessage::Cancel { .. } => MessageType::Cancel,
        }
    }

    /// Type byte plus payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.message_type() as u8];
        match self {
            TransferMessage::Choke
            | TransferMessage::Unchoke
            | TransferMessage::Interested
            | TransferMessage::NotInterested => {}
            TransferMessage::Have(index) => out.put_u32(*index),
            TransferMessage::Bitfield(bits) => out.extend_from_slice(bits),
            TransferMessage::Request {
                index,
                begin,
                length,
            }
            | TransferMessage::Cancel {
                index,
                begin,
                length,
            } => {
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_u32(*length);
            }
            TransferMessage::Piece { index, begin, data } => {
                out.put_u32(*index);
                out.put_u32(*begin);
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Parse a decrypted inner message, enforcing the length table
    pub fn decode(body: &[u8]) -> Result<Self> {
        let Some(&code) = body.first() else {
            return Err(Error::Protocol("empty transfer message".to_string()));
        };
        let msg_type = MessageType::from_byte(code)
            .filter(|t| t.is_transfer())
            .ok_or(Error::UnknownMessage(code))?;
        msg_type.check_length(body.len())?;

        let mut payload = &body[1..];
        Ok(match msg_type {
            MessageType::Choke => TransferMessage::Choke,
            MessageType::Unchoke => TransferMessage::Unchoke,
            MessageType::Interested => TransferMessage::Interested,
            MessageType::NotInterested => TransferMessage::NotInterested,
            MessageType::Have => TransferMessage::Have(payload.get_u32()),
            MessageType::Bitfield => TransferMessage::Bitfield(Bytes::copy_from_slice(payload)),
            MessageType::Request => TransferMessage::Request {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            MessageType::Cancel => TransferMessage::Cancel {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            MessageType::Piece => {
                let index = payload.get_u32();
                let begin = payload.get_u32();
                TransferMessage::Piece {
                    index,
                    begin,
                    data: Bytes::copy_from_slice(payload),
                }
            }
            other => return Err(Error::UnknownMessage(other as u8)),
        })
    }

    /// Check indices against a swarm of `num_pieces` pieces
    pub fn validate(&self, num_pieces: u32) -> Result<()> {
        let index = match self {
            TransferMessage::Have(index)
            | TransferMessage::Request { index, .. }
            | TransferMessage::Cancel { index, .. }
            | TransferMessage::Piece { index, .. } => *index,
            TransferMessage::Bitfield(bits) => return validate_bitfield(bits, num_pieces),
            _ => return Ok(()),
        };
        if index >= num_pieces {
            return Err(Error::InvalidPieceIndex {
                index,
                total: num_pieces,
            });
        }
        Ok(())
    }
}

/// A bitfield must cover exactly `num_pieces` bits with the spare bits clear
fn validate_bitfield(bits: &[u8], num_pieces: u32) -> Result<()> {
    let expected = (num_pieces as usize).div_ceil(8);
    if bits.len() != expected {
        return Err(Error::Protocol(format!(
            "bitfield of {} bytes for {} pieces",
            bits.len(),
            num_pieces
        )));
    }
    let view = bits.view_bits::<Msb0>();
    if view[num_pieces as usize..].any() {
        return Err(Error::Protocol("bitfield has spare bits set".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msgs = vec![
            TransferMessage::Interested,
            TransferMessage::Have(7),
            TransferMessage::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            TransferMessage::Piece {
                index: 0,
                begin: 0,
                data: Bytes::from_static(b"hello"),
            },
            TransferMessage::Bitfield(Bytes::from_static(&[0b1010_0000])),
        ];
        for msg in msgs {
            assert_eq!(TransferMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_request_is_thirteen_bytes() {
        let req = TransferMessage::Request {
            index: 0,
            begin: 0,
            length: 1,
        };
        assert_eq!(req.encode().len(), 13);
    }

    #[test]
    fn test_rejects_network_codes() {
        assert!(matches!(
            TransferMessage::decode(&[MessageType::Confirm as u8]),
            Err(Error::UnknownMessage(0x0A))
        ));
        assert!(TransferMessage::decode(&[]).is_err());
        assert!(TransferMessage::decode(&[MessageType::Have as u8, 0, 0]).is_err());
    }

    #[test]
    fn test_piece_index_range() {
        let piece = TransferMessage::Piece {
            index: 4,
            begin: 0,
            data: Bytes::from_static(b"x"),
        };
        assert!(piece.validate(5).is_ok());
        assert!(matches!(
            piece.validate(4),
            Err(Error::InvalidPieceIndex { index: 4, total: 4 })
        ));
    }

    #[test]
    fn test_bitfield_validation() {
        // 10 pieces -> 2 bytes, last 6 bits spare
        let ok = TransferMessage::Bitfield(Bytes::from_static(&[0xFF, 0b1100_0000]));
        assert!(ok.validate(10).is_ok());

        let spare_set = TransferMessage::Bitfield(Bytes::from_static(&[0xFF, 0b1110_0000]));
        assert!(spare_set.validate(10).is_err());

        let wrong_len = TransferMessage::Bitfield(Bytes::from_static(&[0xFF]));
        assert!(wrong_len.validate(10).is_err());
    }
}
