//! Tracking codes: fixed-length onions describing a source-routed path
//!
//! Layer plaintext layouts:
//!
//! ```text
//! relay:    0x00 ‖ session id (8) ‖ next-hop NID (1) ‖ next layer...
//! terminal: 0x01 ‖ session id (8) ‖ infohash (20) ‖ key (32) ‖ iv (32)
//! ```

use crate::crypto::{self, CryptoContext, IV_LEN, KEY_LEN};
use crate::{Error, InfoHash, Nid, Result, SessionId};
use rsa::{RsaPrivateKey, RsaPublicKey};

/// Default length of a tracking code on the wire
pub const DEFAULT_TCODE_LEN: usize = 4096;

pub const RELAY_TAG: u8 = 0x00;
pub const TERMINAL_TAG: u8 = 0x01;

const RELAY_LAYER_LEN: usize = 1 + SessionId::LEN + 1;
const TERMINAL_LAYER_LEN: usize = 1 + SessionId::LEN + 20 + KEY_LEN + IV_LEN;

/// End-to-end key material handed to both endpoints of a path
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl StreamKey {
    pub fn generate(ctx: &CryptoContext) -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        ctx.fill(&mut key);
        ctx.fill(&mut iv);
        Self { key, iv }
    }

    /// Parse the 64-byte `key ‖ iv` form used in announce responses
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN + IV_LEN {
            return Err(Error::InvalidData(format!(
                "key material must be {} bytes, got {}",
                KEY_LEN + IV_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        iv.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self { key, iv })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.key.to_vec();
        out.extend_from_slice(&self.iv);
        out
    }
}

impl std::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamKey(..)")
    }
}

/// A hop that forwards: whose key to encrypt for and where it sends next
#[derive(Debug, Clone)]
pub struct RelayHop {
    pub public_key: RsaPublicKey,
    pub session_id: SessionId,
    pub next: Nid,
}

/// The destination of a path
#[derive(Debug, Clone)]
pub struct TerminalHop {
    pub public_key: RsaPublicKey,
    pub session_id: SessionId,
    pub infohash: InfoHash,
    pub key: StreamKey,
}

/// Build a tracking code of exactly `code_len` bytes.
///
/// `relays` are ordered from the source outward; the source's own layer
/// comes first so that it peels the outermost onion.
pub fn build(
    ctx: &CryptoContext,
    relays: &[RelayHop],
    terminal: &TerminalHop,
    code_len: usize,
) -> Result<Vec<u8>> {
    let mut plain = Vec::with_capacity(TERMINAL_LAYER_LEN);
    plain.push(TERMINAL_TAG);
    plain.extend_from_slice(terminal.session_id.as_bytes());
    plain.extend_from_slice(&terminal.infohash);
    plain.extend_from_slice(&terminal.key.key);
    plain.extend_from_slice(&terminal.key.iv);
    let mut onion = crypto::encrypt(ctx, &terminal.public_key, &plain, plain.len())?;

    for hop in relays.iter().rev() {
        let mut data = Vec::with_capacity(RELAY_LAYER_LEN + onion.len());
        data.push(RELAY_TAG);
        data.extend_from_slice(hop.session_id.as_bytes());
        data.push(hop.next.0);
        data.extend_from_slice(&onion);
        onion = crypto::encrypt(ctx, &hop.public_key, &data, RELAY_LAYER_LEN)?;
    }

    if onion.len() > code_len {
        return Err(Error::InvalidData(format!(
            "path needs {} bytes, tracking code length is {}",
            onion.len(),
            code_len
        )));
    }
    let pad = ctx.random_bytes(code_len - onion.len());
    onion.extend_from_slice(&pad);
    Ok(onion)
}

/// What one layer told us to do
#[derive(Debug, Clone)]
pub enum Peeled {
    /// Forward `next` (same length as the code we received) to the neighbor `nid`
    Relay { nid: Nid, next: Vec<u8> },
    /// This peer is the destination
    Terminal { infohash: InfoHash, key: StreamKey },
}

/// Peel the outermost layer with the local private key.
///
/// Fails with [`Error::SessionMismatch`] when the layer was built for another
/// run of this peer, or with a crypto error when it was not built for us at all.
pub fn peel(
    ctx: &CryptoContext,
    private_key: &RsaPrivateKey,
    session_id: &SessionId,
    code: &[u8],
) -> Result<Peeled> {
    let layer = crypto::decrypt(private_key, code)?;
    let msg = &layer.message;

    if msg.len() < 1 + SessionId::LEN {
        return Err(Error::Protocol(format!(
            "tracking code layer too short: {} bytes",
            msg.len()
        )));
    }
    if &msg[1..1 + SessionId::LEN] != session_id.as_bytes() {
        return Err(Error::SessionMismatch);
    }

    match msg[0] {
        RELAY_TAG => {
            if msg.len() != RELAY_LAYER_LEN {
                return Err(Error::Protocol(format!(
                    "relay layer has {} bytes",
                    msg.len()
                )));
            }
            let mut next = layer.residue;
            if next.len() < code.len() {
                let pad = ctx.random_bytes(code.len() - next.len());
                next.extend_from_slice(&pad);
            }
            Ok(Peeled::Relay {
                nid: Nid(msg[9]),
                next,
            })
        }
        TERMINAL_TAG => {
            if msg.len() != TERMINAL_LAYER_LEN {
                return Err(Error::Protocol(format!(
                    "terminal layer has {} bytes",
                    msg.len()
                )));
            }
            let mut infohash = [0u8; 20];
            infohash.copy_from_slice(&msg[9..29]);
            let key = StreamKey::from_bytes(&msg[29..93])?;
            Ok(Peeled::Terminal { infohash, key })
        }
        tag => Err(Error::Protocol(format!("unknown tracking code tag {}", tag))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_key;

    struct TestPeer {
        key: &'static RsaPrivateKey,
        session: SessionId,
    }

    fn peers(ctx: &CryptoContext, n: usize) -> Vec<TestPeer> {
        (0..n)
            .map(|i| TestPeer {
                key: test_key(i),
                session: ctx.session_id(),
            })
            .collect()
    }

    /// Onion for the path through `peers`, NIDs numbered by position
    fn build_for(ctx: &CryptoContext, peers: &[TestPeer], key: &StreamKey) -> Vec<u8> {
        let (dest, hops) = peers.split_last().unwrap();
        let relays: Vec<RelayHop> = hops
            .iter()
            .enumerate()
            .map(|(i, p)| RelayHop {
                public_key: p.key.to_public_key(),
                session_id: p.session,
                next: Nid(10 + i as u8),
            })
            .collect();
        let terminal = TerminalHop {
            public_key: dest.key.to_public_key(),
            session_id: dest.session,
            infohash: [0x33; 20],
            key: key.clone(),
        };
        build(ctx, &relays, &terminal, DEFAULT_TCODE_LEN).unwrap()
    }

    #[test]
    fn test_onion_inverse() {
        let ctx = CryptoContext::new().unwrap();
        for len in 3..=6 {
            let path = peers(&ctx, len);
            let key = StreamKey::generate(&ctx);
            let mut code = build_for(&ctx, &path, &key);
            assert_eq!(code.len(), DEFAULT_TCODE_LEN);

            for (i, hop) in path.iter().enumerate() {
                match peel(&ctx, hop.key, &hop.session, &code).unwrap() {
                    Peeled::Relay { nid, next } => {
                        assert!(i < len - 1);
                        assert_eq!(nid, Nid(10 + i as u8));
                        assert_eq!(next.len(), DEFAULT_TCODE_LEN);
                        code = next;
                    }
                    Peeled::Terminal { infohash, key: got } => {
                        assert_eq!(i, len - 1);
                        assert_eq!(infohash, [0x33; 20]);
                        assert_eq!(got, key);
                    }
                }
            }
        }
    }

    #[test]
    fn test_peel_at_wrong_peer_fails() {
        let ctx = CryptoContext::new().unwrap();
        let path = peers(&ctx, 3);
        let code = build_for(&ctx, &path, &StreamKey::generate(&ctx));

        // Second hop's key cannot open the outermost layer
        assert!(peel(&ctx, path[1].key, &path[1].session, &code).is_err());
        // Right key, stale session
        let stale = ctx.session_id();
        assert!(matches!(
            peel(&ctx, path[0].key, &stale, &code),
            Err(Error::SessionMismatch)
        ));
    }

    #[test]
    fn test_path_too_long_for_code() {
        let ctx = CryptoContext::new().unwrap();
        let path = peers(&ctx, 6);
        let (dest, hops) = path.split_last().unwrap();
        let relays: Vec<RelayHop> = hops
            .iter()
            .map(|p| RelayHop {
                public_key: p.key.to_public_key(),
                session_id: p.session,
                next: Nid(1),
            })
            .collect();
        let terminal = TerminalHop {
            public_key: dest.key.to_public_key(),
            session_id: dest.session,
            infohash: [0; 20],
            key: StreamKey::generate(&ctx),
        };
        assert!(build(&ctx, &relays, &terminal, 1024).is_err());
    }

    #[test]
    fn test_stream_key_bytes() {
        let ctx = CryptoContext::new().unwrap();
        let key = StreamKey::generate(&ctx);
        assert_eq!(StreamKey::from_bytes(&key.to_bytes()).unwrap(), key);
        assert!(StreamKey::from_bytes(&[0; 10]).is_err());
    }
}
