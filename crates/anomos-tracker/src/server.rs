//! HTTPS front end and the tracker event loop
//!
//! Connection tasks terminate TLS, capture the client certificate and turn
//! each HTTP request into a job. One loop owns the [`Tracker`] and answers
//! jobs in arrival order, so announces never interleave.

use crate::config::Config;
use crate::natcheck;
use crate::tracker::{Probe, Tracker, TrackerStats};
use crate::TrackerError;
use anomos_core::announce::{b64_decode, AnnounceRequest, AnnounceResponse};
use anomos_core::tls::{self, ClientAuth};
use anomos_core::{CryptoContext, Identity, InfoHash, PeerCertificate};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, PRAGMA};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Commands accepted by a running tracker loop
#[derive(Debug)]
pub enum Command {
    Stats { reply: oneshot::Sender<TrackerStats> },
    /// Write the state file now
    Save,
    Shutdown,
}

/// Cloneable handle to a running tracker loop
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TrackerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    pub fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("tracker loop has stopped"))
    }

    pub async fn stats(&self) -> Result<TrackerStats> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stats { reply })?;
        Ok(rx.await?)
    }

    pub fn save(&self) -> Result<()> {
        self.command(Command::Save)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}

/// A request handed from a connection task to the loop
enum Job {
    Announce {
        query: String,
        certificate: Option<PeerCertificate>,
        remote: IpAddr,
        reply: oneshot::Sender<Reply>,
    },
    Scrape {
        query: String,
        reply: oneshot::Sender<Reply>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    status: StatusCode,
    body: Vec<u8>,
}

impl Reply {
    fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: message.into().into_bytes(),
        }
    }

    fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::text(StatusCode::BAD_REQUEST, format!("Bad request: {}", message))
    }

    fn bencoded(encoded: anomos_core::Result<Vec<u8>>) -> Self {
        match encoded {
            Ok(body) => Self {
                status: StatusCode::OK,
                body,
            },
            Err(e) => {
                warn!("Failed to encode response: {}", e);
                Self::text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    fn into_response(self) -> hyper::Response<Full<Bytes>> {
        let mut response = hyper::Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        response
    }
}

/// Load state, bind the configured address and serve until shut down
pub async fn run_tracker(
    config: Config,
    identity: Arc<Identity>,
    ctx: Arc<CryptoContext>,
    commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let blocked = config.load_blocked()?;
    if !blocked.is_empty() {
        info!("Refusing {} blocked infohashes", blocked.len());
    }
    let state_file = config.state_file();
    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;

    let mut tracker = Tracker::new(ctx, config, blocked);
    if state_file.exists() {
        if let Err(e) = tracker.load(&state_file) {
            warn!("Ignoring state file {}: {}", state_file.display(), e);
        }
    }
    serve(listener, tracker, identity, Some(state_file), commands).await
}

/// Serve HTTPS on `listener` with `tracker` as the only owner of the state
pub async fn serve(
    listener: TcpListener,
    mut tracker: Tracker,
    identity: Arc<Identity>,
    state_file: Option<PathBuf>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    // Scrapes may come without a certificate; announces are checked per request
    let acceptor = TlsAcceptor::from(tls::server_config(&identity, ClientAuth::Optional)?);
    let socket_timeout = tracker.config().socket_timeout();

    let expire_every = Duration::from_secs(tracker.config().timeout_downloaders_interval.max(1));
    let save_every = Duration::from_secs(tracker.config().save_dfile_interval.max(1));
    let mut expire = interval_at(Instant::now() + expire_every, expire_every);
    let mut save = interval_at(Instant::now() + save_every, save_every);
    expire.set_missed_tick_behavior(MissedTickBehavior::Delay);
    save.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (job_tx, mut jobs) = mpsc::unbounded_channel();
    let (probe_tx, mut probes) = mpsc::unbounded_channel::<(Probe, bool)>();

    info!(
        "Tracker {} listening on {}",
        identity.peer_id(),
        listener.local_addr()?
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => spawn_connection(acceptor.clone(), tcp, addr, job_tx.clone(), socket_timeout),
                Err(e) => warn!("Accept failed: {}", e),
            },
            Some(job) = jobs.recv() => match job {
                Job::Announce { query, certificate, remote, reply } => {
                    let (answer, probe) = answer_announce(&mut tracker, &query, certificate, remote, unix_now());
                    if let Some(probe) = probe {
                        spawn_probe(identity.clone(), probe, socket_timeout, probe_tx.clone());
                    }
                    let _ = reply.send(answer);
                }
                Job::Scrape { query, reply } => {
                    let _ = reply.send(answer_scrape(&tracker, &query));
                }
            },
            Some((probe, reachable)) = probes.recv() => tracker.nat_result(probe, reachable),
            _ = expire.tick() => {
                tracker.expire(unix_now());
                let stats = tracker.stats();
                info!(
                    "{} peers ({} reachable) in {} swarms",
                    stats.peers,
                    stats.reachable,
                    stats.swarms.len()
                );
            }
            _ = save.tick() => save_state(&tracker, state_file.as_deref()),
            command = commands.recv() => match command {
                Some(Command::Stats { reply }) => {
                    let _ = reply.send(tracker.stats());
                }
                Some(Command::Save) => save_state(&tracker, state_file.as_deref()),
                Some(Command::Shutdown) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    save_state(&tracker, state_file.as_deref());
    Ok(())
}

fn save_state(tracker: &Tracker, path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = tracker.save(path) {
        warn!("Failed to save state to {}: {}", path.display(), e);
    }
}

fn spawn_probe(
    identity: Arc<Identity>,
    probe: Probe,
    timeout: Duration,
    results: mpsc::UnboundedSender<(Probe, bool)>,
) {
    tokio::spawn(async move {
        let reachable = natcheck::check(identity, probe.peer_id, probe.addr, timeout).await;
        let _ = results.send((probe, reachable));
    });
}

fn spawn_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    addr: SocketAddr,
    jobs: mpsc::UnboundedSender<Job>,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let stream = match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("TLS accept from {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                debug!("TLS accept from {} timed out", addr);
                return;
            }
        };
        let certificate = tls::peer_certificate(stream.get_ref().1.peer_certificates()).ok();
        let remote = addr.ip().to_canonical();

        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let jobs = jobs.clone();
            let certificate = certificate.clone();
            async move { Ok::<_, Infallible>(route(req, certificate, remote, jobs).await) }
        });
        let result = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(timeout)
            .serve_connection(TokioIo::new(stream), service)
            .await;
        if let Err(e) = result {
            debug!("Connection from {} ended: {}", addr, e);
        }
    });
}

async fn route(
    req: hyper::Request<Incoming>,
    certificate: Option<PeerCertificate>,
    remote: IpAddr,
    jobs: mpsc::UnboundedSender<Job>,
) -> hyper::Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return Reply::text(StatusCode::METHOD_NOT_ALLOWED, "GET only").into_response();
    }
    let query = req.uri().query().unwrap_or("").to_string();
    let (reply, answer) = oneshot::channel();
    let job = match req.uri().path().trim_start_matches('/') {
        "announce" => Job::Announce {
            query,
            certificate,
            remote,
            reply,
        },
        "scrape" => Job::Scrape { query, reply },
        _ => return Reply::text(StatusCode::NOT_FOUND, "not found").into_response(),
    };
    if jobs.send(job).is_err() {
        return Reply::text(StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    match answer.await {
        Ok(reply) => reply.into_response(),
        Err(_) => Reply::text(StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response(),
    }
}

fn answer_announce(
    tracker: &mut Tracker,
    query: &str,
    certificate: Option<PeerCertificate>,
    remote: IpAddr,
    now: u64,
) -> (Reply, Option<Probe>) {
    let Some(certificate) = certificate else {
        return (
            Reply::bad_request("announce requires a client certificate"),
            None,
        );
    };
    let request = match AnnounceRequest::from_query(query) {
        Ok(request) => request,
        Err(e) => return (Reply::bad_request(e), None),
    };
    match tracker.announce(&request, &certificate, remote, now) {
        Ok(answer) => (Reply::bencoded(answer.response.encode()), answer.probe),
        Err(TrackerError::BadRequest(message)) => (Reply::bad_request(message), None),
        Err(TrackerError::Refused(reason)) => (
            Reply::bencoded(AnnounceResponse::failure(reason).encode()),
            None,
        ),
        Err(e) => {
            warn!("Announce from {} failed: {}", remote, e);
            (
                Reply::text(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
                None,
            )
        }
    }
}

fn answer_scrape(tracker: &Tracker, query: &str) -> Reply {
    let requested = form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "info_hash")
        .map(|(_, v)| v.into_owned());
    let info_hash = match requested {
        Some(encoded) => match parse_info_hash(&encoded) {
            Some(hash) => Some(hash),
            None => return Reply::bad_request("info_hash must be 20 bytes"),
        },
        None => None,
    };
    Reply::bencoded(tracker.scrape(info_hash.as_ref()).encode())
}

fn parse_info_hash(encoded: &str) -> Option<InfoHash> {
    b64_decode(encoded).ok()?.try_into().ok()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anomos_core::announce::{b64_encode, Event, ScrapeResponse};
    use anomos_core::testing::test_identity;
    use anomos_core::SessionId;
    use std::collections::HashSet;

    const NOW: u64 = 5_000;

    fn tracker() -> Tracker {
        Tracker::new(
            Arc::new(CryptoContext::from_seed([6; 32])),
            Config::default(),
            HashSet::new(),
        )
    }

    fn query() -> String {
        AnnounceRequest {
            info_hash: [9; 20],
            port: 7000,
            event: Some(Event::Started),
            uploaded: 0,
            downloaded: 0,
            left: 10,
            session_id: Some(SessionId([1; 8])),
            failed: vec![],
            ip: None,
        }
        .to_query()
    }

    fn local() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[test]
    fn test_announce_needs_certificate() {
        let mut t = tracker();
        let (reply, probe) = answer_announce(&mut t, &query(), None, local(), NOW);
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert!(probe.is_none());
        assert!(t.model().is_empty());
    }

    #[test]
    fn test_garbage_query_is_bad_request() {
        let mut t = tracker();
        let cert = test_identity(0).certificate().clone();
        let (reply, _) = answer_announce(&mut t, "info_hash=abc&port=1", Some(cert), local(), NOW);
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_announce_answers_bencoded() {
        let mut t = tracker();
        let id = test_identity(0);
        let (reply, probe) =
            answer_announce(&mut t, &query(), Some(id.certificate().clone()), local(), NOW);
        assert_eq!(reply.status, StatusCode::OK);
        let response = AnnounceResponse::decode(&reply.body).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(probe.unwrap().addr, SocketAddr::new(local(), 7000));
    }

    #[test]
    fn test_refusal_is_failure_reason() {
        let mut t = tracker();
        let id = test_identity(0);
        answer_announce(&mut t, &query(), Some(id.certificate().clone()), local(), NOW);

        let impostor = Identity::from_key(id.private_key().clone(), "impostor").unwrap();
        let (reply, _) = answer_announce(
            &mut t,
            &query(),
            Some(impostor.certificate().clone()),
            local(),
            NOW,
        );
        assert_eq!(reply.status, StatusCode::OK);
        let response = AnnounceResponse::decode(&reply.body).unwrap();
        assert!(response.failure_reason.unwrap().contains("certificate"));
    }

    #[test]
    fn test_scrape_query() {
        let mut t = tracker();
        let id = test_identity(0);
        answer_announce(&mut t, &query(), Some(id.certificate().clone()), local(), NOW);

        let all = answer_scrape(&t, "");
        let scrape = ScrapeResponse::decode(&all.body).unwrap();
        assert_eq!(scrape.get(&[9; 20]).unwrap().incomplete, 1);

        let one = answer_scrape(&t, &format!("info_hash={}", b64_encode(&[8; 20])));
        assert!(ScrapeResponse::decode(&one.body).unwrap().files.is_empty());

        let bad = answer_scrape(&t, "info_hash=AAAA");
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    }
}
