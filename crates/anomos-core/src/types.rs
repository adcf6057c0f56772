//! Core identifiers shared by peers and the tracker

use serde::{Deserialize, Serialize};
use std::fmt;

/// 20-byte content identifier of a swarm
pub type InfoHash = [u8; 20];

/// Stream id within one neighbor link
pub type StreamId = u16;

/// Stable peer identity: last 20 bytes of SHA-256 over the DER public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell peers apart in logs
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// Per-run tag binding a tracking-code layer to the recipient's process
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 8]);

impl SessionId {
    pub const LEN: usize = 8;

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

/// One-byte edge label, unique within a neighbor pair
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid(pub u8);

impl Nid {
    /// Reserved for the tracker's reachability probe; never issued for an edge
    pub const NAT_CHECK: Nid = Nid(0xFF);

    pub fn is_nat_check(self) -> bool {
        self == Self::NAT_CHECK
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl fmt::Debug for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nid({:#04x})", self.0)
    }
}

/// Helper to format an infohash as hex string
pub fn hash_to_hex(hash: &InfoHash) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into an infohash
pub fn hex_to_hash(s: &str) -> Result<InfoHash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    bytes
        .try_into()
        .map_err(|_| hex::FromHexError::InvalidStringLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = [0xabu8; 20];
        let s = hash_to_hex(&hash);
        assert_eq!(s.len(), 40);
        assert_eq!(hex_to_hash(&s).unwrap(), hash);
        assert!(hex_to_hash("abcd").is_err());
    }

    #[test]
    fn test_session_id_from_slice() {
        assert!(SessionId::from_slice(&[1; 8]).is_some());
        assert!(SessionId::from_slice(&[1; 7]).is_none());
    }

    #[test]
    fn test_nat_check_nid() {
        assert!(Nid(0xFF).is_nat_check());
        assert!(!Nid(0).is_nat_check());
    }
}
