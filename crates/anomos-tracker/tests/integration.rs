//! Integration tests for the Anomos tracker
//!
//! These run the HTTPS server on localhost and talk to it with the peer's
//! own tracker client, so certificate pinning and client authentication are
//! exercised the way they are in a deployment.

use anomos_core::announce::{AnnounceRequest, Event};
use anomos_core::testing::test_identity;
use anomos_core::{hash_to_hex, CryptoContext, Identity, InfoHash, SessionId};
use anomos_peer::announce::TrackerClient;
use anomos_peer::config::{Config as PeerConfig, NetworkConfig, SwarmConfig, TrackerConfig};
use anomos_peer::{run_peer_loop, PeerHandle};
use anomos_tracker::{serve, Config, Tracker, TrackerHandle, TrackerStats};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SWARM: InfoHash = [0x5a; 20];

struct TestTracker {
    port: u16,
    handle: TrackerHandle,
    task: JoinHandle<anyhow::Result<()>>,
    cert_path: PathBuf,
    state_path: PathBuf,
    _dir: TempDir,
}

async fn start_tracker() -> TestTracker {
    let identity = Arc::new(test_identity(0));
    let config = Config {
        socket_timeout: 5,
        ..Default::default()
    };
    let tracker = Tracker::new(
        Arc::new(CryptoContext::from_seed([21; 32])),
        config,
        HashSet::new(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("tracker.crt");
    std::fs::write(&cert_path, identity.cert_pem()).unwrap();
    let state_path = dir.path().join("state.json");

    let (handle, commands) = TrackerHandle::channel();
    let task = tokio::spawn(serve(
        listener,
        tracker,
        identity,
        Some(state_path.clone()),
        commands,
    ));
    TestTracker {
        port,
        handle,
        task,
        cert_path,
        state_path,
        _dir: dir,
    }
}

impl TestTracker {
    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            url: format!("https://127.0.0.1:{}/announce", self.port),
            certificate: Some(self.cert_path.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    fn client(&self, identity: &Identity) -> TrackerClient {
        TrackerClient::new(identity, &self.tracker_config()).unwrap()
    }

    async fn wait_for(&self, what: &str, check: impl Fn(&TrackerStats) -> bool) -> TrackerStats {
        for _ in 0..100 {
            let stats = self.handle.stats().await.unwrap();
            if check(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}

fn started(session: u8, port: u16) -> AnnounceRequest {
    AnnounceRequest {
        info_hash: SWARM,
        port,
        event: Some(Event::Started),
        uploaded: 0,
        downloaded: 0,
        left: 1000,
        session_id: Some(SessionId([session; 8])),
        failed: vec![],
        ip: None,
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A real peer announces, answers the probe, and leaves with `stopped`
#[tokio::test]
async fn test_nat_probe_marks_peer_reachable() {
    let tracker = start_tracker().await;
    let data = tempfile::tempdir().unwrap();

    let config = PeerConfig {
        data_dir: data.path().to_string_lossy().into_owned(),
        tracker: tracker.tracker_config(),
        network: NetworkConfig {
            bind: "127.0.0.1".to_string(),
            listen_port: free_port().await,
            ..Default::default()
        },
        swarms: vec![SwarmConfig {
            info_hash: hash_to_hex(&SWARM),
            num_pieces: 8,
            left: 1000,
        }],
    };
    let (peer, commands) = PeerHandle::channel();
    let (app_tx, _app_rx) = mpsc::unbounded_channel();
    let peer_task = tokio::spawn(run_peer_loop(
        config,
        Arc::new(test_identity(1)),
        Arc::new(CryptoContext::from_seed([22; 32])),
        commands,
        app_tx,
    ));

    let stats = tracker
        .wait_for("reachable peer", |s| s.reachable == 1)
        .await;
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.probing, 0);
    assert_eq!(stats.swarms.len(), 1);
    assert_eq!(stats.swarms[0].leechers, 1);

    peer.shutdown().unwrap();
    peer_task.await.unwrap().unwrap();
    let stats = tracker.handle.stats().await.unwrap();
    assert_eq!(stats.peers, 0);
    assert!(stats.swarms.is_empty());
}

#[tokio::test]
async fn test_unreachable_peer_is_not_promoted() {
    let tracker = start_tracker().await;
    let identity = test_identity(2);
    let client = tracker.client(&identity);

    // Nothing listens on this port
    let response = client.announce(&started(1, free_port().await)).await.unwrap();
    assert_eq!(response.interval, Some(1800));
    assert!(response.peers.is_empty());

    let stats = tracker.wait_for("probe to finish", |s| s.probing == 0).await;
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.reachable, 0);
}

#[tokio::test]
async fn test_certificate_mismatch_rejected() {
    let tracker = start_tracker().await;
    let honest = test_identity(3);
    tracker
        .client(&honest)
        .announce(&started(1, 1))
        .await
        .unwrap();

    let impostor = Identity::from_key(honest.private_key().clone(), "impostor").unwrap();
    assert_eq!(impostor.peer_id(), honest.peer_id());
    let err = tracker
        .client(&impostor)
        .announce(&started(2, 2))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("certificate"), "{:#}", err);

    let stats = tracker.handle.stats().await.unwrap();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.swarms[0].leechers, 1);
}

#[tokio::test]
async fn test_scrape_and_pinning() {
    let tracker = start_tracker().await;
    let seed = test_identity(4);
    let mut request = started(1, 1);
    request.left = 0;
    tracker.client(&seed).announce(&request).await.unwrap();
    tracker
        .client(&test_identity(5))
        .announce(&started(2, 2))
        .await
        .unwrap();

    let scrape = tracker.client(&seed).scrape(Some(&SWARM)).await.unwrap();
    let entry = scrape.get(&SWARM).unwrap();
    assert_eq!((entry.complete, entry.incomplete), (1, 1));

    // A client pinned to some other certificate refuses this tracker
    let dir = tempfile::tempdir().unwrap();
    let wrong = dir.path().join("other.crt");
    std::fs::write(&wrong, test_identity(6).cert_pem()).unwrap();
    let config = TrackerConfig {
        certificate: Some(wrong.to_string_lossy().into_owned()),
        ..tracker.tracker_config()
    };
    let client = TrackerClient::new(&seed, &config).unwrap();
    assert!(client.scrape(None).await.is_err());
}

#[tokio::test]
async fn test_state_saved_on_shutdown() {
    let tracker = start_tracker().await;
    let identity = test_identity(7);
    tracker
        .client(&identity)
        .announce(&started(1, 1))
        .await
        .unwrap();

    tracker.handle.shutdown().unwrap();
    tracker.task.await.unwrap().unwrap();

    let mut restored = Tracker::new(
        Arc::new(CryptoContext::from_seed([23; 32])),
        Config::default(),
        HashSet::new(),
    );
    restored.load(&tracker.state_path).unwrap();
    assert_eq!(restored.stats().peers, 1);
    assert!(restored.model().contains(&identity.peer_id()));
}
