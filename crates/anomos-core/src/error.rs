//! Error types for Anomos

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Message of {len} bytes exceeds maximum of {max}")]
    Oversize { len: usize, max: usize },

    #[error("Bad handshake: {0}")]
    Handshake(String),

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessage(u8),

    #[error("Invalid piece index: {index}, swarm has {total} pieces")]
    InvalidPieceIndex { index: u32, total: u32 },

    #[error("Checksum mismatch in decrypted layer")]
    BadChecksum,

    #[error("Session id mismatch")]
    SessionMismatch,

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Coarse classification driving the recovery policy of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad framing, bad handshake, oversize message, invalid piece index
    ProtocolViolation,
    /// Decrypt failure or bad checksum
    CryptoFailure,
    /// Connect timeout or TLS failure; reported to the tracker
    Unreachable,
    /// Tracking code terminates here for content we do not serve
    UnknownResource,
    /// Worth retrying with backoff
    Transient,
    /// Refuse to start
    Fatal,
    Io,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(_)
            | Error::Oversize { .. }
            | Error::Handshake(_)
            | Error::UnknownMessage(_)
            | Error::InvalidPieceIndex { .. } => ErrorKind::ProtocolViolation,
            Error::BadChecksum | Error::SessionMismatch | Error::Crypto(_) | Error::Rsa(_) => {
                ErrorKind::CryptoFailure
            }
            Error::Unreachable(_) | Error::Tls(_) | Error::Certificate(_) => ErrorKind::Unreachable,
            Error::UnknownResource(_) => ErrorKind::UnknownResource,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Io(_) => ErrorKind::Io,
            Error::Bencode(_) | Error::NotFound(_) | Error::InvalidData(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::Oversize { len: 10, max: 5 }.kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(Error::BadChecksum.kind(), ErrorKind::CryptoFailure);
        assert_eq!(
            Error::UnknownResource("x".into()).kind(),
            ErrorKind::UnknownResource
        );
        assert_eq!(Error::Fatal("rng".into()).kind(), ErrorKind::Fatal);
    }
}
