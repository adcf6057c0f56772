//! Hybrid RSA-OAEP + AES encryption with an integrity tag
//!
//! Layout of one encrypted layer:
//!
//! ```text
//! RSA-OAEP(key ‖ iv) ‖ AES-CFB(checksum ‖ len ‖ data ‖ pad)
//! ```
//!
//! `checksum` is SHA-1 over `key ‖ len ‖ data[..len]`, where `len` is the
//! big-endian length of the plaintext the recipient should keep. Everything
//! after those `len` bytes is returned as residue so the next onion layer can
//! ride inside the current one.

use super::cipher::{decrypt_once, encrypt_once};
use super::CryptoContext;
use crate::{Error, Result};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

/// Ephemeral AES-256 key length
pub const KEY_LEN: usize = 32;

/// IV length carried alongside every key
pub const IV_LEN: usize = 32;

/// SHA-1 tag length
pub const CHECKSUM_LEN: usize = 20;

const LENGTH_LEN: usize = 4;

/// Bulk ciphertext is padded to a multiple of this
const PAD_BLOCK: usize = 32;

/// Result of peeling one layer
#[derive(Debug, Clone)]
pub struct Decrypted {
    /// The `len` plaintext bytes covered by the checksum
    pub message: Vec<u8>,
    /// Decrypted bytes following the message (continuation plus padding)
    pub residue: Vec<u8>,
}

fn checksum(key: &[u8], len: u32, message: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(len.to_be_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Encrypt `data` for `recipient`; only `data[..plaintext_len]` is covered by
/// the checksum and reported back as the message on decrypt.
pub fn encrypt(
    ctx: &CryptoContext,
    recipient: &RsaPublicKey,
    data: &[u8],
    plaintext_len: usize,
) -> Result<Vec<u8>> {
    if plaintext_len > data.len() {
        return Err(Error::Crypto(format!(
            "plaintext length {} exceeds data length {}",
            plaintext_len,
            data.len()
        )));
    }
    let len = u32::try_from(plaintext_len)
        .map_err(|_| Error::Crypto("plaintext too long".to_string()))?;

    let mut secret = [0u8; KEY_LEN + IV_LEN];
    ctx.fill(&mut secret);
    let (key, iv) = secret.split_at(KEY_LEN);

    let esk = ctx.with_rng(|rng| recipient.encrypt(rng, Oaep::new::<Sha1>(), &secret))?;

    let content_len = CHECKSUM_LEN + LENGTH_LEN + data.len();
    let pad_len = PAD_BLOCK - content_len % PAD_BLOCK;
    let mut content = Vec::with_capacity(content_len + pad_len);
    content.extend_from_slice(&checksum(key, len, &data[..plaintext_len]));
    content.extend_from_slice(&len.to_be_bytes());
    content.extend_from_slice(data);
    let mut pad = vec![0u8; pad_len];
    ctx.fill(&mut pad);
    content.extend_from_slice(&pad);

    encrypt_once(key, iv, &mut content)?;

    let mut out = esk;
    out.extend_from_slice(&content);
    Ok(out)
}

/// Decrypt one layer with the local private key
pub fn decrypt(private_key: &RsaPrivateKey, data: &[u8]) -> Result<Decrypted> {
    let block = private_key.size();
    if data.len() < block + CHECKSUM_LEN + LENGTH_LEN {
        return Err(Error::Crypto(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }

    let secret = private_key.decrypt(Oaep::new::<Sha1>(), &data[..block])?;
    if secret.len() != KEY_LEN + IV_LEN {
        return Err(Error::Crypto(format!(
            "unexpected session key length: {}",
            secret.len()
        )));
    }
    let (key, iv) = secret.split_at(KEY_LEN);

    let mut content = data[block..].to_vec();
    decrypt_once(key, iv, &mut content)?;

    let tag = &content[..CHECKSUM_LEN];
    let mut len_bytes = [0u8; LENGTH_LEN];
    len_bytes.copy_from_slice(&content[CHECKSUM_LEN..CHECKSUM_LEN + LENGTH_LEN]);
    let len = u32::from_be_bytes(len_bytes);

    let start = CHECKSUM_LEN + LENGTH_LEN;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= content.len())
        .ok_or(Error::BadChecksum)?;
    let message = &content[start..end];

    if checksum(key, len, message) != tag {
        return Err(Error::BadChecksum);
    }

    Ok(Decrypted {
        message: message.to_vec(),
        residue: content[end..].to_vec(),
    })
}
