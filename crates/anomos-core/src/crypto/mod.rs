//! Cryptographic primitives
//!
//! Everything that consumes randomness takes a [`CryptoContext`], which owns
//! the process CSPRNG. The context is created once by the peer or tracker and
//! threaded through constructors instead of living in a global.

mod cipher;
mod identity;
mod onion;

pub use cipher::StreamCipher;
pub use identity::{peer_id_from_public_key, Identity, PeerCertificate, RSA_KEY_BITS};
pub use onion::{decrypt, encrypt, Decrypted, CHECKSUM_LEN, IV_LEN, KEY_LEN};

use crate::{Error, Result, SessionId};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Mutex;

/// Owner of the process random number generator
pub struct CryptoContext {
    rng: Mutex<StdRng>,
}

impl CryptoContext {
    /// Seed a new context from the operating system
    pub fn new() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| Error::Fatal(format!("random number generator unavailable: {}", e)))?;
        Ok(Self::from_seed(seed))
    }

    /// Create a context with a fixed seed (reproducible tests)
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(StdRng::from_seed(seed)),
        }
    }

    /// Run `f` with exclusive access to the generator
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        // A panic while holding the lock cannot leave the generator in a bad state
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    pub fn fill(&self, buf: &mut [u8]) {
        self.with_rng(|rng| rng.fill_bytes(buf));
    }

    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf);
        buf
    }

    /// Fresh per-run session id
    pub fn session_id(&self) -> SessionId {
        let mut id = [0u8; SessionId::LEN];
        self.fill(&mut id);
        SessionId(id)
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoContext")
    }
}
