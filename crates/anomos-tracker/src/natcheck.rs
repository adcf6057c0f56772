//! Inbound reachability probe
//!
//! The tracker dials the announced address, checks over TLS that the
//! listener holds the announcing peer's key, and exchanges a neighbor
//! handshake for the reserved NID. Any failure counts as unreachable.

use anomos_core::handshake::{handshake_bytes, HandshakeReader, HandshakeStatus};
use anomos_core::{tls, Identity, Nid, PeerId};
use anyhow::{anyhow, bail, Result};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Connect to `addr` and complete the NAT-check handshake, all within `timeout`
pub async fn probe(
    identity: &Identity,
    peer_id: PeerId,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<()> {
    let connector = TlsConnector::from(tls::pinned_client_config(identity, peer_id)?);
    tokio::time::timeout(timeout, exchange(connector, addr))
        .await
        .map_err(|_| anyhow!("timed out after {:?}", timeout))?
}

async fn exchange(connector: TlsConnector, addr: SocketAddr) -> Result<()> {
    let tcp = TcpStream::connect(addr).await?;
    let mut stream = connector.connect(ServerName::from(addr.ip()), tcp).await?;
    stream.write_all(&handshake_bytes(Nid::NAT_CHECK)).await?;
    stream.flush().await?;

    let mut reader = HandshakeReader::new(Some(Nid::NAT_CHECK));
    let mut buf = [0u8; 64];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("connection closed during handshake");
        }
        if let HandshakeStatus::Complete { .. } = reader.feed(&buf[..n])? {
            break;
        }
    }
    let _ = stream.shutdown().await;
    Ok(())
}

/// Run a probe and log the outcome; true when the peer answered
pub async fn check(
    identity: Arc<Identity>,
    peer_id: PeerId,
    addr: SocketAddr,
    timeout: Duration,
) -> bool {
    match probe(&identity, peer_id, addr, timeout).await {
        Ok(()) => {
            tracing::debug!("NAT check of {} at {} succeeded", peer_id, addr);
            true
        }
        Err(e) => {
            tracing::info!("NAT check failed for {} at {}: {:#}", peer_id, addr, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anomos_core::testing::test_identity;
    use anomos_core::tls::ClientAuth;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    /// Accept one link and answer its handshake with `reply`
    async fn answer_once(listener: TcpListener, peer: Identity, reply: Nid) {
        let acceptor =
            TlsAcceptor::from(tls::server_config(&peer, ClientAuth::Required).unwrap());
        let (tcp, _) = listener.accept().await.unwrap();
        let Ok(mut stream) = acceptor.accept(tcp).await else {
            return;
        };
        let mut reader = HandshakeReader::new(None);
        let mut buf = [0u8; 64];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            if let HandshakeStatus::Complete { nid, .. } = reader.feed(&buf[..n]).unwrap() {
                assert_eq!(nid, Nid::NAT_CHECK);
                break;
            }
        }
        stream.write_all(&handshake_bytes(reply)).await.unwrap();
        stream.flush().await.unwrap();
        let _ = stream.read(&mut buf).await;
    }

    #[tokio::test]
    async fn test_probe_reachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = test_identity(1);
        let peer_id = peer.peer_id();
        let server = tokio::spawn(answer_once(listener, peer, Nid::NAT_CHECK));

        let tracker = test_identity(0);
        probe(&tracker, peer_id, addr, Duration::from_secs(10))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_rejects_wrong_nid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = test_identity(1);
        let peer_id = peer.peer_id();
        tokio::spawn(answer_once(listener, peer, Nid(4)));

        let tracker = Arc::new(test_identity(0));
        assert!(!check(tracker, peer_id, addr, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_probe_rejects_other_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(answer_once(listener, test_identity(2), Nid::NAT_CHECK));

        let tracker = test_identity(0);
        let expected = test_identity(1).peer_id();
        assert!(probe(&tracker, expected, addr, Duration::from_secs(10))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_probe_nobody_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tracker = test_identity(0);
        let peer_id = test_identity(1).peer_id();
        assert!(probe(&tracker, peer_id, addr, Duration::from_secs(5))
            .await
            .is_err());
    }
}
