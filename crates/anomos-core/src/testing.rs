//! Shared fixtures for tests across the workspace
//!
//! RSA key generation dominates test time, so a small pool of keys is made
//! once per test binary and handed out by index.

use crate::crypto::{CryptoContext, Identity, RSA_KEY_BITS};
use rsa::RsaPrivateKey;
use std::sync::OnceLock;

pub const POOL_SIZE: usize = 8;

static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();

/// Key `index` of the pool; panics past [`POOL_SIZE`]
pub fn test_key(index: usize) -> &'static RsaPrivateKey {
    let keys = KEYS.get_or_init(|| {
        let ctx = CryptoContext::new().expect("seed test rng");
        (0..POOL_SIZE)
            .map(|_| {
                ctx.with_rng(|rng| RsaPrivateKey::new(rng, RSA_KEY_BITS))
                    .expect("generate test key")
            })
            .collect()
    });
    &keys[index]
}

pub fn test_identity(index: usize) -> Identity {
    Identity::from_key(test_key(index).clone(), "localhost").expect("self-sign test certificate")
}
