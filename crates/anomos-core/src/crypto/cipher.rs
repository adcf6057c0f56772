//! Per-stream symmetric cipher

use crate::{Error, Result};
use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};

/// AES-256 in CFB mode with independent, persistent encrypt and decrypt state.
///
/// Both directions are initialized once from the same key and IV. Because
/// the state carries over between calls, ciphertext must be decrypted in the
/// exact order it was produced.
pub struct StreamCipher {
    encryptor: BufEncryptor<Aes256>,
    decryptor: BufDecryptor<Aes256>,
}

impl StreamCipher {
    /// `iv` may be longer than the 16-byte AES block; only its prefix is used.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() < 16 {
            return Err(Error::Crypto(format!("IV too short: {} bytes", iv.len())));
        }
        let iv = &iv[..16];
        let encryptor = BufEncryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::Crypto(format!("bad key length: {}", key.len())))?;
        let decryptor = BufDecryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::Crypto(format!("bad key length: {}", key.len())))?;
        Ok(Self {
            encryptor,
            decryptor,
        })
    }

    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        self.encryptor.encrypt(&mut buf);
        buf
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        self.decryptor.decrypt(&mut buf);
        buf
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamCipher")
    }
}

/// One-shot encryption under a fresh key/IV pair
pub(crate) fn encrypt_once(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let iv = iv.get(..16).unwrap_or(iv);
    let mut encryptor = BufEncryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("bad key or IV length".to_string()))?;
    encryptor.encrypt(data);
    Ok(())
}

pub(crate) fn decrypt_once(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let iv = iv.get(..16).unwrap_or(iv);
    let mut decryptor = BufDecryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("bad key or IV length".to_string()))?;
    decryptor.decrypt(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_carries_over() {
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let mut alice = StreamCipher::new(&key, &iv).unwrap();
        let mut bob = StreamCipher::new(&key, &iv).unwrap();

        // Odd-sized messages exercise the buffered partial block
        let first = alice.encrypt(b"interested");
        let second = alice.encrypt(b"piece data follows here");
        assert_eq!(bob.decrypt(&first), b"interested");
        assert_eq!(bob.decrypt(&second), b"piece data follows here");
    }

    #[test]
    fn test_reordered_ciphertext_corrupts() {
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let mut alice = StreamCipher::new(&key, &iv).unwrap();
        let mut bob = StreamCipher::new(&key, &iv).unwrap();

        let first = alice.encrypt(b"first message!!!");
        let second = alice.encrypt(b"second message!!");
        assert_ne!(bob.decrypt(&second), b"second message!!");
        assert_ne!(bob.decrypt(&first), b"first message!!!");
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(StreamCipher::new(&[0u8; 16], &[0u8; 32]).is_err());
        assert!(StreamCipher::new(&[0u8; 32], &[0u8; 8]).is_err());
    }
}
