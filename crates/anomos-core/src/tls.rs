//! TLS configuration for neighbor links, the tracker, and the NAT probe
//!
//! Every party uses a self-signed certificate, so there is no chain to
//! verify. Handshake signatures are still checked against the presented
//! certificate; identity is established afterwards by comparing the
//! certificate fingerprint with what the tracker told us to expect.

use crate::crypto::{Identity, PeerCertificate};
use crate::{Error, PeerId, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::sync::Arc;

/// Whether a server insists on a client certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    Required,
    Optional,
}

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts any well-formed RSA certificate, or only the one whose
/// fingerprint is `pinned`
#[derive(Debug)]
struct SelfSignedVerifier {
    provider: Arc<CryptoProvider>,
    client_auth: ClientAuth,
    pinned: Option<PeerId>,
}

impl SelfSignedVerifier {
    fn check(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let cert = PeerCertificate::from_der(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        match self.pinned {
            Some(expected) if cert.peer_id() != expected => Err(rustls::Error::General(format!(
                "certificate {} does not match pinned {}",
                cert.peer_id(),
                expected
            ))),
            _ => Ok(()),
        }
    }
}

impl ServerCertVerifier for SelfSignedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for SelfSignedVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.client_auth == ClientAuth::Required
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn certified_key(identity: &Identity) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = CertificateDer::from(identity.cert_der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_pkcs8_der()?));
    Ok((vec![cert], key))
}

/// Server side of a neighbor link or the tracker's HTTPS listener
pub fn server_config(identity: &Identity, client_auth: ClientAuth) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let verifier = Arc::new(SelfSignedVerifier {
        provider: provider.clone(),
        client_auth,
        pinned: None,
    });
    let (certs, key) = certified_key(identity)?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client side of a neighbor link or NAT probe, presenting `identity`
pub fn client_config(identity: &Identity) -> Result<Arc<ClientConfig>> {
    build_client_config(identity, None)
}

/// Client config that only talks to the server holding `server`'s key
pub fn pinned_client_config(identity: &Identity, server: PeerId) -> Result<Arc<ClientConfig>> {
    build_client_config(identity, Some(server))
}

fn build_client_config(identity: &Identity, pinned: Option<PeerId>) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let verifier = Arc::new(SelfSignedVerifier {
        provider: provider.clone(),
        client_auth: ClientAuth::Required,
        pinned,
    });
    let (certs, key) = certified_key(identity)?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Extract the remote party's certificate after the TLS handshake
pub fn peer_certificate(certs: Option<&[CertificateDer<'_>]>) -> Result<PeerCertificate> {
    let end_entity = certs
        .and_then(|c| c.first())
        .ok_or_else(|| Error::Certificate("peer presented no certificate".to_string()))?;
    PeerCertificate::from_der(end_entity.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_identity;

    #[test]
    fn test_build_configs() {
        let identity = test_identity(0);
        let server = server_config(&identity, ClientAuth::Required).unwrap();
        assert!(server.verifier().client_auth_mandatory());
        let optional = server_config(&identity, ClientAuth::Optional).unwrap();
        assert!(!optional.verifier().client_auth_mandatory());
        client_config(&identity).unwrap();
        pinned_client_config(&identity, test_identity(1).peer_id()).unwrap();
    }

    #[test]
    fn test_pinned_verifier() {
        let verifier = SelfSignedVerifier {
            provider: provider(),
            client_auth: ClientAuth::Required,
            pinned: Some(test_identity(1).peer_id()),
        };
        let good = CertificateDer::from(test_identity(1).cert_der().to_vec());
        let bad = CertificateDer::from(test_identity(2).cert_der().to_vec());
        assert!(verifier.check(&good).is_ok());
        assert!(verifier.check(&bad).is_err());
    }

    #[test]
    fn test_peer_certificate_extraction() {
        let identity = test_identity(1);
        let der = CertificateDer::from(identity.cert_der().to_vec());
        let cert = peer_certificate(Some(&[der])).unwrap();
        assert_eq!(cert.peer_id(), identity.peer_id());
        assert!(peer_certificate(None).is_err());
    }
}
