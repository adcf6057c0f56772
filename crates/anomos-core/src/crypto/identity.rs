//! Long-term peer identity: RSA keypair plus self-signed certificate

use super::CryptoContext;
use crate::{Error, PeerId, Result};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use time::OffsetDateTime;

/// Modulus size for generated keys (public exponent is F4)
pub const RSA_KEY_BITS: usize = 2048;

const KEY_FILE: &str = "identity.key";
const CERT_FILE: &str = "identity.crt";
const VALIDITY_DAYS: i64 = 5 * 365;

/// Compute the peer id: last 20 bytes of SHA-256 over the DER public key
pub fn peer_id_from_public_key(key: &RsaPublicKey) -> Result<PeerId> {
    let der = key
        .to_public_key_der()
        .map_err(|e| Error::Crypto(format!("public key encoding failed: {}", e)))?;
    let digest = Sha256::digest(der.as_bytes());
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[digest.len() - 20..]);
    Ok(PeerId(id))
}

/// A certificate presented by a remote party, reduced to what we check
#[derive(Clone)]
pub struct PeerCertificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
    peer_id: PeerId,
}

impl PeerCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::Certificate(format!("unparseable certificate: {}", e)))?;
        let public_key = RsaPublicKey::from_public_key_der(cert.public_key().raw)
            .map_err(|e| Error::Certificate(format!("not an RSA certificate: {}", e)))?;
        let peer_id = peer_id_from_public_key(&public_key)?;
        Ok(Self {
            der: der.to_vec(),
            public_key,
            peer_id,
        })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let der = first_certificate(pem)?;
        Self::from_der(&der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl std::fmt::Debug for PeerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerCertificate({})", self.peer_id)
    }
}

fn first_certificate(pem: &[u8]) -> Result<Vec<u8>> {
    let mut reader = std::io::BufReader::new(pem);
    let first = rustls_pemfile::certs(&mut reader).next();
    match first {
        Some(Ok(der)) => Ok(der.as_ref().to_vec()),
        Some(Err(e)) => Err(Error::Certificate(format!("bad PEM: {}", e))),
        None => Err(Error::Certificate("no certificate in PEM".to_string())),
    }
}

/// Our own keypair and certificate
pub struct Identity {
    key: RsaPrivateKey,
    cert: PeerCertificate,
    cert_pem: String,
}

impl Identity {
    /// Generate a fresh keypair and wrap it in a certificate for `hostname`
    pub fn generate(ctx: &CryptoContext, hostname: &str) -> Result<Self> {
        let key = ctx.with_rng(|rng| RsaPrivateKey::new(rng, RSA_KEY_BITS))?;
        Self::from_key(key, hostname)
    }

    /// Build an identity around an existing key with a new self-signed certificate
    pub fn from_key(key: RsaPrivateKey, hostname: &str) -> Result<Self> {
        let (der, pem) = self_signed_certificate(&key, hostname)?;
        let cert = PeerCertificate::from_der(&der)?;
        Ok(Self {
            key,
            cert,
            cert_pem: pem,
        })
    }

    /// Load the identity stored in `dir`, generating and saving one if absent
    pub fn load_or_generate(
        ctx: &CryptoContext,
        dir: &Path,
        hostname: &str,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        if dir.join(KEY_FILE).exists() {
            return Self::load(dir, passphrase);
        }
        tracing::info!("Generating {}-bit RSA identity", RSA_KEY_BITS);
        let identity = Self::generate(ctx, hostname)?;
        identity.save(ctx, dir, passphrase)?;
        tracing::info!("Saved identity {} to {}", identity.peer_id(), dir.display());
        Ok(identity)
    }

    /// Read key and certificate from `dir`; any failure here is fatal
    pub fn load(dir: &Path, passphrase: Option<&str>) -> Result<Self> {
        let key_pem = std::fs::read_to_string(dir.join(KEY_FILE))
            .map_err(|e| Error::Fatal(format!("cannot read keyfile: {}", e)))?;
        let key = if key_pem.contains("ENCRYPTED PRIVATE KEY") {
            let passphrase = passphrase
                .ok_or_else(|| Error::Fatal("keyfile is encrypted, no passphrase given".into()))?;
            RsaPrivateKey::from_pkcs8_encrypted_pem(&key_pem, passphrase)
        } else {
            RsaPrivateKey::from_pkcs8_pem(&key_pem)
        }
        .map_err(|e| Error::Fatal(format!("cannot decode keyfile: {}", e)))?;

        let cert_pem = std::fs::read_to_string(dir.join(CERT_FILE))
            .map_err(|e| Error::Fatal(format!("cannot read certificate: {}", e)))?;
        let cert = PeerCertificate::from_pem(cert_pem.as_bytes())?;
        if cert.public_key() != &key.to_public_key() {
            return Err(Error::Fatal(
                "certificate does not match private key".to_string(),
            ));
        }

        Ok(Self {
            key,
            cert,
            cert_pem,
        })
    }

    /// Persist key (optionally passphrase-encrypted) and certificate to `dir`
    pub fn save(&self, ctx: &CryptoContext, dir: &Path, passphrase: Option<&str>) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let key_pem = match passphrase {
            Some(pass) => ctx.with_rng(|rng| {
                self.key
                    .to_pkcs8_encrypted_pem(rng, pass.as_bytes(), LineEnding::LF)
            }),
            None => self.key.to_pkcs8_pem(LineEnding::LF),
        }
        .map_err(|e| Error::Crypto(format!("key encoding failed: {}", e)))?;

        std::fs::write(dir.join(KEY_FILE), key_pem.as_bytes())?;
        std::fs::write(dir.join(CERT_FILE), &self.cert_pem)?;
        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        self.cert.peer_id()
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        self.cert.public_key()
    }

    pub fn certificate(&self) -> &PeerCertificate {
        &self.cert
    }

    pub fn cert_der(&self) -> &[u8] {
        self.cert.der()
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Unencrypted PKCS#8 DER, as TLS stacks want it
    pub fn key_pkcs8_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .key
            .to_pkcs8_der()
            .map_err(|e| Error::Crypto(format!("key encoding failed: {}", e)))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Key followed by certificate, both PEM
    pub fn identity_pem(&self) -> Result<Vec<u8>> {
        let key_pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("key encoding failed: {}", e)))?;
        let mut out = key_pem.as_bytes().to_vec();
        out.extend_from_slice(self.cert_pem.as_bytes());
        Ok(out)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.peer_id())
    }
}

fn self_signed_certificate(key: &RsaPrivateKey, hostname: &str) -> Result<(Vec<u8>, String)> {
    let cert_err = |e: rcgen::Error| Error::Certificate(e.to_string());

    let key_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("key encoding failed: {}", e)))?;
    let key_pair = KeyPair::from_pkcs8_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(cert_err)?;

    let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(cert_err)?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, hostname);
    params.distinguished_name = name;

    let now = OffsetDateTime::now_utc();
    params.serial_number = Some(SerialNumber::from(now.unix_timestamp().max(1) as u64));
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params.self_signed(&key_pair).map_err(cert_err)?;
    Ok((cert.der().to_vec(), cert.pem()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_identity, test_key};

    #[test]
    fn test_peer_id_matches_certificate() {
        let identity = test_identity(0);
        let expected = peer_id_from_public_key(&test_key(0).to_public_key()).unwrap();
        assert_eq!(identity.peer_id(), expected);

        let parsed = PeerCertificate::from_der(identity.cert_der()).unwrap();
        assert_eq!(parsed.peer_id(), expected);
        let parsed = PeerCertificate::from_pem(identity.cert_pem().as_bytes()).unwrap();
        assert_eq!(parsed.peer_id(), expected);
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        assert_ne!(test_identity(0).peer_id(), test_identity(1).peer_id());
    }

    #[test]
    fn test_save_and_load() {
        let ctx = CryptoContext::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let identity = test_identity(2);
        identity.save(&ctx, dir.path(), None).unwrap();

        let loaded = Identity::load(dir.path(), None).unwrap();
        assert_eq!(loaded.peer_id(), identity.peer_id());
        assert_eq!(loaded.cert_der(), identity.cert_der());
    }

    #[test]
    fn test_passphrase_protected_key() {
        let ctx = CryptoContext::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let identity = test_identity(3);
        identity.save(&ctx, dir.path(), Some("hunter2")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(KEY_FILE)).unwrap();
        assert!(raw.contains("ENCRYPTED PRIVATE KEY"));

        assert!(matches!(Identity::load(dir.path(), None), Err(Error::Fatal(_))));
        assert!(matches!(
            Identity::load(dir.path(), Some("wrong")),
            Err(Error::Fatal(_))
        ));
        let loaded = Identity::load(dir.path(), Some("hunter2")).unwrap();
        assert_eq!(loaded.peer_id(), identity.peer_id());
    }

    #[test]
    fn test_missing_keyfile_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Identity::load(dir.path(), None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Fatal);
    }

    #[test]
    fn test_garbage_certificate() {
        assert!(PeerCertificate::from_der(b"not a certificate").is_err());
        assert!(PeerCertificate::from_pem(b"").is_err());
    }
}
