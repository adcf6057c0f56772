//! Neighbor handshake
//!
//! After TLS is up, each side sends `[6]"Anomos"[nid][7 zero bytes]`. The
//! side that dialed writes first; the accepting side answers only after it
//! has read and validated the incoming header.

use crate::{Error, Nid, Result};

pub const PROTOCOL_NAME: &[u8] = b"Anomos";

const RESERVED_LEN: usize = 7;

/// Total handshake length on the wire
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_NAME.len() + 1 + RESERVED_LEN;

/// Handshake bytes announcing `nid`
pub fn handshake_bytes(nid: Nid) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_LEN);
    out.push(PROTOCOL_NAME.len() as u8);
    out.extend_from_slice(PROTOCOL_NAME);
    out.push(nid.0);
    out.extend_from_slice(&[0u8; RESERVED_LEN]);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    NameLength,
    Name,
    Nid,
    Reserved,
    Done,
}

impl Stage {
    fn len(self) -> usize {
        match self {
            Stage::NameLength => 1,
            Stage::Name => PROTOCOL_NAME.len(),
            Stage::Nid => 1,
            Stage::Reserved => RESERVED_LEN,
            Stage::Done => 0,
        }
    }
}

/// Progress report from [`HandshakeReader::feed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More bytes needed
    Pending,
    /// Header validated; `rest` holds any bytes that followed it
    Complete { nid: Nid, rest: Vec<u8> },
}

/// Incremental reader for the remote handshake header.
///
/// With an expected NID (we dialed, or the tracker told us who to expect)
/// the incoming NID must match; without one the NID is learned from the wire.
#[derive(Debug)]
pub struct HandshakeReader {
    stage: Stage,
    buf: Vec<u8>,
    expected: Option<Nid>,
    nid: Option<Nid>,
}

impl HandshakeReader {
    pub fn new(expected: Option<Nid>) -> Self {
        Self {
            stage: Stage::NameLength,
            buf: Vec::new(),
            expected,
            nid: None,
        }
    }

    /// Bytes still needed to finish the current stage
    pub fn next_expected_len(&self) -> usize {
        self.stage.len().saturating_sub(self.buf.len())
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn feed(&mut self, mut data: &[u8]) -> Result<HandshakeStatus> {
        while self.stage != Stage::Done {
            let want = self.next_expected_len();
            let take = want.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() < self.stage.len() {
                return Ok(HandshakeStatus::Pending);
            }
            let chunk = std::mem::take(&mut self.buf);
            self.stage = self.advance(&chunk)?;
        }
        let nid = self
            .nid
            .ok_or_else(|| Error::Handshake("handshake finished without NID".to_string()))?;
        Ok(HandshakeStatus::Complete {
            nid,
            rest: data.to_vec(),
        })
    }

    fn advance(&mut self, chunk: &[u8]) -> Result<Stage> {
        match self.stage {
            Stage::NameLength => {
                if chunk[0] as usize != PROTOCOL_NAME.len() {
                    return Err(Error::Handshake(format!(
                        "bad protocol name length {}",
                        chunk[0]
                    )));
                }
                Ok(Stage::Name)
            }
            Stage::Name => {
                if chunk != PROTOCOL_NAME {
                    return Err(Error::Handshake(format!(
                        "bad protocol name {:?}",
                        String::from_utf8_lossy(chunk)
                    )));
                }
                Ok(Stage::Nid)
            }
            Stage::Nid => {
                let nid = Nid(chunk[0]);
                if let Some(expected) = self.expected {
                    if nid != expected {
                        return Err(Error::Handshake(format!(
                            "NID mismatch: expected {}, got {}",
                            expected, nid
                        )));
                    }
                }
                self.nid = Some(nid);
                Ok(Stage::Reserved)
            }
            Stage::Reserved => {
                if chunk.iter().any(|b| *b != 0) {
                    return Err(Error::Handshake("reserved bytes not zero".to_string()));
                }
                Ok(Stage::Done)
            }
            Stage::Done => Ok(Stage::Done),
        }
    }
}
