//! End of a path: the stream that speaks the transfer sub-protocol
//!
//! Transfer messages travel as `RELAY ‖ ENCRYPTED ‖ ciphertext` so relays
//! forward them like any other opaque body. The cipher keeps state across
//! messages, so every envelope must be opened in the order it was sealed.

use anomos_core::wire::MessageType;
use anomos_core::{Error, InfoHash, Result, StreamCipher, StreamKey, TransferMessage};
use bytes::Bytes;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// TCODE sent, waiting for CONFIRM
    Initiating,
    Established,
    /// BREAK sent, waiting for ACKBREAK
    Closing,
    Closed,
}

impl EndpointState {
    pub fn name(self) -> &'static str {
        match self {
            EndpointState::Initiating => "initiating",
            EndpointState::Established => "established",
            EndpointState::Closing => "closing",
            EndpointState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub struct EndpointStream {
    pub state: EndpointState,
    pub info_hash: InfoHash,
    /// True on the peer that started the circuit
    pub initiator: bool,
    pub num_pieces: u32,
    pub since: Instant,
    /// Whether the owner has been told the stream is gone
    pub closed_notified: bool,
    cipher: StreamCipher,
}

impl EndpointStream {
    pub fn new(
        info_hash: InfoHash,
        num_pieces: u32,
        key: &StreamKey,
        initiator: bool,
        now: Instant,
    ) -> Result<Self> {
        let state = if initiator {
            EndpointState::Initiating
        } else {
            EndpointState::Established
        };
        Ok(Self {
            state,
            info_hash,
            initiator,
            num_pieces,
            since: now,
            closed_notified: false,
            cipher: StreamCipher::new(&key.key, &key.iv)?,
        })
    }

    pub fn set_state(&mut self, state: EndpointState, now: Instant) {
        self.state = state;
        self.since = now;
    }

    pub fn is_established(&self) -> bool {
        self.state == EndpointState::Established
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, EndpointState::Closing | EndpointState::Closed)
    }

    /// Encrypt a transfer message into a body ready for the link
    pub fn seal(&mut self, msg: &TransferMessage) -> Result<Bytes> {
        msg.validate(self.num_pieces)?;
        let ciphertext = self.cipher.encrypt(&msg.encode());
        let mut body = Vec::with_capacity(2 + ciphertext.len());
        body.push(MessageType::Relay as u8);
        body.push(MessageType::Encrypted as u8);
        body.extend_from_slice(&ciphertext);
        Ok(Bytes::from(body))
    }

    /// Decrypt and check one ENCRYPTED payload
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<TransferMessage> {
        if ciphertext.is_empty() {
            return Err(Error::Protocol("empty ENCRYPTED payload".to_string()));
        }
        let plain = self.cipher.decrypt(ciphertext);
        let msg = TransferMessage::decode(&plain)?;
        msg.validate(self.num_pieces)?;
        Ok(msg)
    }
}

/// The ciphertext inside a RELAY payload, if it carries an ENCRYPTED envelope
pub fn encrypted_payload(relay_payload: &[u8]) -> Option<&[u8]> {
    match relay_payload.split_first() {
        Some((&code, rest)) if code == MessageType::Encrypted as u8 && !rest.is_empty() => {
            Some(rest)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anomos_core::CryptoContext;

    fn pair() -> (EndpointStream, EndpointStream) {
        let ctx = CryptoContext::from_seed([3; 32]);
        let key = StreamKey::generate(&ctx);
        let now = Instant::now();
        (
            EndpointStream::new([1; 20], 8, &key, true, now).unwrap(),
            EndpointStream::new([1; 20], 8, &key, false, now).unwrap(),
        )
    }

    #[test]
    fn test_seal_and_open_in_order() {
        let (mut a, mut b) = pair();
        assert_eq!(a.state, EndpointState::Initiating);
        assert!(b.is_established());

        let msgs = [
            TransferMessage::Interested,
            TransferMessage::Request {
                index: 1,
                begin: 0,
                length: 5,
            },
            TransferMessage::Piece {
                index: 1,
                begin: 0,
                data: Bytes::from_static(b"hello"),
            },
        ];
        for msg in &msgs {
            let body = a.seal(msg).unwrap();
            assert_eq!(body[0], MessageType::Relay as u8);
            let ct = encrypted_payload(&body[1..]).unwrap();
            assert_eq!(&b.open(ct).unwrap(), msg);
        }
    }

    #[test]
    fn test_out_of_range_piece_rejected() {
        let (mut a, mut b) = pair();
        assert!(a.seal(&TransferMessage::Have(8)).is_err());

        // A peer using a larger piece count gets caught on open
        a.num_pieces = 100;
        let body = a.seal(&TransferMessage::Have(50)).unwrap();
        let ct = encrypted_payload(&body[1..]).unwrap();
        assert!(matches!(
            b.open(ct),
            Err(Error::InvalidPieceIndex { index: 50, total: 8 })
        ));
    }

    #[test]
    fn test_encrypted_payload() {
        assert_eq!(encrypted_payload(&[0x0B, 1, 2]), Some(&[1u8, 2][..]));
        assert_eq!(encrypted_payload(&[0x0B]), None);
        assert_eq!(encrypted_payload(&[0x07, 1]), None);
    }
}
