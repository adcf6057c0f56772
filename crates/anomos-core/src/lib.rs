//! Anomos Core - Shared types, crypto, and wire protocol
//!
//! This crate provides the building blocks shared by Anomos peers and the
//! tracker: identities and certificates, the onion and stream ciphers, the
//! neighbor-link framing and handshake, tracking codes, and the tracker's
//! announce wire format.

pub mod announce;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod tcode;
pub mod tls;
pub mod transfer;
pub mod types;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crypto::{CryptoContext, Identity, PeerCertificate, StreamCipher};
pub use error::{Error, ErrorKind, Result};
pub use tcode::StreamKey;
pub use transfer::TransferMessage;
pub use types::*;

/// Default length of a path, source and destination included
pub const DEFAULT_MAX_PATH_LEN: usize = 6;

/// Shortest path the tracker will issue
pub const MIN_PATH_LEN: usize = 3;
