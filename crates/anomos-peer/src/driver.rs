//! Tokio driver for the overlay
//!
//! A single task owns the [`Overlay`] and every other piece of protocol
//! state. TLS accepts and dials run in helper tasks, and each link gets a
//! reader task and a writer task; all of them report back to the loop over
//! one channel. The loop is the only writer of link sockets: it moves bytes
//! from the overlay's send queues to a link's writer only while that writer
//! has less than [`WRITE_WINDOW`] bytes outstanding, so a slow socket leaves
//! its backlog in the overlay where the relay watermarks can see it.

use crate::announce::{Backoff, TrackerClient};
use crate::config::Config;
use crate::link::{LinkId, LinkRole, StreamRef};
use crate::neighbors::{self, Dial, NeighborManager};
use crate::overlay::{LinkStats, Overlay, OverlayConfig, OverlayEvent};
use anomos_core::announce::{AnnounceRequest, AnnounceResponse, Event};
use anomos_core::tls::{self, ClientAuth};
use anomos_core::{hash_to_hex, CryptoContext, Identity, InfoHash, Nid, TransferMessage};
use anyhow::{anyhow, Result};
use rustls::pki_types::ServerName;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

const READ_BUF_LEN: usize = 16 * 1024;
/// Bytes a writer task may hold that it has not written yet
const WRITE_WINDOW: usize = 64 * 1024;
const TICK_INTERVAL: Duration = Duration::from_millis(250);
const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the file-transfer side hears about its streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Opened {
        stream: StreamRef,
        info_hash: InfoHash,
        initiator: bool,
    },
    Closed {
        stream: StreamRef,
        info_hash: InfoHash,
    },
    Message {
        stream: StreamRef,
        info_hash: InfoHash,
        message: TransferMessage,
    },
}

#[derive(Debug)]
pub enum Command {
    Send {
        stream: StreamRef,
        message: TransferMessage,
    },
    Close {
        stream: StreamRef,
    },
    AddSwarm {
        info_hash: InfoHash,
        num_pieces: u32,
        left: u64,
    },
    RemoveSwarm {
        info_hash: InfoHash,
    },
    /// Byte counts reported by the file-transfer side
    Transferred {
        info_hash: InfoHash,
        uploaded: u64,
        downloaded: u64,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LinkStats>>,
    },
    Shutdown,
}

/// Cloneable handle to a running peer loop
#[derive(Debug, Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    pub fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("peer loop has stopped"))
    }

    pub fn send(&self, stream: StreamRef, message: TransferMessage) -> Result<()> {
        self.command(Command::Send { stream, message })
    }

    pub fn close(&self, stream: StreamRef) -> Result<()> {
        self.command(Command::Close { stream })
    }

    pub async fn snapshot(&self) -> Result<Vec<LinkStats>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply })?;
        Ok(rx.await?)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}

enum NetEvent {
    Connected {
        role: LinkRole,
        nid: Option<Nid>,
        addr: SocketAddr,
        stream: Box<TlsStream<TcpStream>>,
    },
    DialFailed {
        nid: Nid,
        error: String,
    },
    Data {
        link: LinkId,
        bytes: Vec<u8>,
    },
    Written,
    Closed {
        link: LinkId,
    },
    Announced {
        info_hash: InfoHash,
        event: Option<Event>,
        failed: Vec<Nid>,
        result: Result<AnnounceResponse>,
    },
}

enum WriteOp {
    Data(Vec<u8>),
    Close,
}

/// The loop's side of one link's socket tasks
struct LinkIo {
    writer: mpsc::UnboundedSender<WriteOp>,
    pause: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    reader: JoinHandle<()>,
}

impl LinkIo {
    fn close(self) {
        let _ = self.writer.send(WriteOp::Close);
        self.reader.abort();
    }
}

/// Token bucket for the upload limit; a rate of 0 means unlimited
struct RateLimiter {
    rate: u64,
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            tokens: rate as f64,
            last: Instant::now(),
        }
    }

    fn available(&mut self, now: Instant) -> usize {
        if self.rate == 0 {
            return usize::MAX;
        }
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.tokens.max(0.0) as usize
    }

    fn consume(&mut self, bytes: usize) {
        if self.rate > 0 {
            self.tokens -= bytes as f64;
        }
    }
}

struct PeerLoop {
    config: Config,
    overlay: Overlay,
    neighbors: NeighborManager,
    tracker: Arc<TrackerClient>,
    connector: TlsConnector,
    links: HashMap<LinkId, LinkIo>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    app: mpsc::UnboundedSender<AppEvent>,
    limiter: RateLimiter,
    backoff: Backoff,
    next_announce: Instant,
    announcing: usize,
    /// Failed neighbors not yet acknowledged by a successful announce
    unreported: Vec<Nid>,
}

/// Run the peer until shutdown is requested or the process is interrupted
pub async fn run_peer_loop(
    config: Config,
    identity: Arc<Identity>,
    ctx: Arc<CryptoContext>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    app: mpsc::UnboundedSender<AppEvent>,
) -> Result<()> {
    let session_id = ctx.session_id();
    let mut overlay = Overlay::new(
        ctx,
        identity.clone(),
        session_id,
        OverlayConfig::from(&config.network),
    );
    for swarm in &config.swarms {
        overlay
            .swarms_mut()
            .add(swarm.info_hash()?, swarm.num_pieces, swarm.left);
    }

    let acceptor = TlsAcceptor::from(tls::server_config(&identity, ClientAuth::Required)?);
    let connector = TlsConnector::from(tls::client_config(&identity)?);
    let tracker = Arc::new(TrackerClient::new(&identity, &config.tracker)?);

    let listener =
        TcpListener::bind((config.network.bind.as_str(), config.network.listen_port)).await?;
    tracing::info!(
        "Peer {} listening on {} with {} swarm(s)",
        identity.peer_id(),
        listener.local_addr()?,
        overlay.swarms().len()
    );

    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let mut state = PeerLoop {
        neighbors: NeighborManager::new(&config.network),
        limiter: RateLimiter::new(config.network.max_upload_rate),
        backoff: Backoff::from_config(&config.tracker),
        config,
        overlay,
        tracker,
        connector,
        links: HashMap::new(),
        net_tx,
        app,
        next_announce: Instant::now(),
        announcing: 0,
        unreported: Vec::new(),
    };

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        let announce_at = tokio::time::Instant::from_std(state.next_announce);
        let can_announce = state.announcing == 0;

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => state.spawn_accept(acceptor.clone(), tcp, addr),
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            Some(event) = net_rx.recv() => state.on_net_event(event),
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => state.on_command(command),
            },
            _ = tick.tick() => state.overlay.tick(Instant::now()),
            _ = tokio::time::sleep_until(announce_at), if can_announce => state.announce_all(),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }

        state.pump();
    }

    state.shutdown().await;
    Ok(())
}

impl PeerLoop {
    fn spawn_accept(&self, acceptor: TlsAcceptor, tcp: TcpStream, addr: SocketAddr) {
        let net_tx = self.net_tx.clone();
        let timeout = self.config.network.handshake_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    let _ = net_tx.send(NetEvent::Connected {
                        role: LinkRole::Acceptor,
                        nid: None,
                        addr,
                        stream: Box::new(TlsStream::from(stream)),
                    });
                }
                Ok(Err(e)) => tracing::debug!("TLS accept from {} failed: {}", addr, e),
                Err(_) => tracing::debug!("TLS accept from {} timed out", addr),
            }
        });
    }

    fn spawn_dial(&mut self, dial: Dial) {
        self.overlay.dialing(dial.nid);
        let connector = self.connector.clone();
        let net_tx = self.net_tx.clone();
        let timeout = self.config.network.handshake_timeout();
        tracing::debug!("Dialing NID {} at {}:{}", dial.nid, dial.host, dial.port);
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, connect(&connector, &dial))
                .await
                .unwrap_or_else(|_| Err(anyhow!("timed out")));
            let event = match result {
                Ok((stream, addr)) => NetEvent::Connected {
                    role: LinkRole::Dialer,
                    nid: Some(dial.nid),
                    addr,
                    stream: Box::new(stream),
                },
                Err(e) => NetEvent::DialFailed {
                    nid: dial.nid,
                    error: format!("{:#}", e),
                },
            };
            let _ = net_tx.send(event);
        });
    }

    fn on_net_event(&mut self, event: NetEvent) {
        let now = Instant::now();
        match event {
            NetEvent::Connected {
                role,
                nid,
                addr,
                stream,
            } => {
                let peer_id = match tls::peer_certificate(stream.get_ref().1.peer_certificates()) {
                    Ok(cert) => cert.peer_id(),
                    Err(e) => {
                        tracing::warn!("Rejecting link with {}: {}", addr, e);
                        if let Some(nid) = nid {
                            self.dial_failed(nid);
                        }
                        return;
                    }
                };
                let link = match (role, nid) {
                    (LinkRole::Dialer, Some(nid)) => {
                        self.overlay.add_dialed_link(nid, peer_id, now)
                    }
                    _ => self.overlay.add_accepted_link(peer_id, now),
                };
                self.neighbors.connected(nid, link, addr.ip());
                self.links
                    .insert(link, spawn_link_io(link, *stream, self.net_tx.clone()));
            }
            NetEvent::DialFailed { nid, error } => {
                tracing::info!("Dial to NID {} failed: {}", nid, error);
                self.dial_failed(nid);
            }
            NetEvent::Data { link, bytes } => {
                // The overlay logs and drops the link itself
                let _ = self.overlay.receive(link, &bytes, now);
            }
            NetEvent::Written => {}
            NetEvent::Closed { link } => self.overlay.link_closed(link, now),
            NetEvent::Announced {
                info_hash,
                event,
                failed,
                result,
            } => self.on_announced(info_hash, event, failed, result),
        }
    }

    fn dial_failed(&mut self, nid: Nid) {
        match self.neighbors.dial_failed(nid) {
            Some(dial) => self.spawn_dial(dial),
            None => self.overlay.dial_failed(nid, Instant::now()),
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Send { stream, message } => {
                if let Err(e) = self.overlay.send_transfer(stream, &message) {
                    tracing::warn!("Dropping {:?} for {}: {}", message, stream, e);
                }
            }
            Command::Close { stream } => self.overlay.close_endpoint(stream, now),
            Command::AddSwarm {
                info_hash,
                num_pieces,
                left,
            } => {
                tracing::info!("Joining swarm {}", hash_to_hex(&info_hash));
                self.overlay.swarms_mut().add(info_hash, num_pieces, left);
                self.next_announce = now;
            }
            Command::RemoveSwarm { info_hash } => {
                if self.overlay.swarms().contains(&info_hash) {
                    tracing::info!("Leaving swarm {}", hash_to_hex(&info_hash));
                    self.spawn_announce(info_hash, Some(Event::Stopped), Vec::new());
                    self.overlay.swarms_mut().remove(&info_hash);
                }
            }
            Command::Transferred {
                info_hash,
                uploaded,
                downloaded,
            } => {
                let swarms = self.overlay.swarms_mut();
                swarms.record_uploaded(&info_hash, uploaded);
                swarms.record_downloaded(&info_hash, downloaded);
                let completed = swarms
                    .get(&info_hash)
                    .is_some_and(|s| s.pending_event == Some(Event::Completed));
                if completed {
                    tracing::info!("Swarm {} complete", hash_to_hex(&info_hash));
                    self.next_announce = now;
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.overlay.snapshot());
            }
            // Handled by the loop
            Command::Shutdown => {}
        }
    }

    fn announce_all(&mut self) {
        let now = Instant::now();
        let infohashes: Vec<InfoHash> = self.overlay.swarms().iter().map(|(ih, _)| *ih).collect();
        if infohashes.is_empty() {
            self.next_announce = now + Duration::from_secs(self.config.tracker.rerequest_interval);
            return;
        }

        self.unreported.extend(self.overlay.take_failed());
        self.unreported.sort();
        self.unreported.dedup();
        let failed = self.unreported.clone();
        for info_hash in infohashes {
            let event = self.overlay.swarms_mut().take_event(&info_hash);
            self.spawn_announce(info_hash, event, failed.clone());
        }
    }

    fn announce_request(
        &self,
        info_hash: InfoHash,
        event: Option<Event>,
        failed: Vec<Nid>,
    ) -> AnnounceRequest {
        let swarm = self.overlay.swarms().get(&info_hash);
        AnnounceRequest {
            info_hash,
            port: self.config.network.listen_port,
            event,
            uploaded: swarm.map_or(0, |s| s.uploaded),
            downloaded: swarm.map_or(0, |s| s.downloaded),
            left: swarm.map_or(0, |s| s.left),
            session_id: Some(self.overlay.session_id()),
            failed,
            ip: self.config.tracker.ip.clone(),
        }
    }

    fn spawn_announce(&mut self, info_hash: InfoHash, event: Option<Event>, failed: Vec<Nid>) {
        let request = self.announce_request(info_hash, event, failed.clone());
        let tracker = self.tracker.clone();
        let net_tx = self.net_tx.clone();
        self.announcing += 1;
        tokio::spawn(async move {
            let result = tracker.announce(&request).await;
            let _ = net_tx.send(NetEvent::Announced {
                info_hash,
                event,
                failed,
                result,
            });
        });
    }

    fn on_announced(
        &mut self,
        info_hash: InfoHash,
        event: Option<Event>,
        failed: Vec<Nid>,
        result: Result<AnnounceResponse>,
    ) {
        self.announcing = self.announcing.saturating_sub(1);
        let now = Instant::now();
        let hex = hash_to_hex(&info_hash);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Announce for {} failed: {:#}", hex, e);
                if event != Some(Event::Stopped) {
                    self.overlay.swarms_mut().restore_event(&info_hash, event);
                }
                let delay = match self.backoff.failure(now) {
                    Ok(delay) => delay,
                    Err(e) => {
                        tracing::error!("{:#}", e);
                        Duration::from_secs(self.config.tracker.max_announce_retry_interval)
                    }
                };
                self.next_announce = self.next_announce.max(now + delay);
                return;
            }
        };

        self.backoff.success();
        self.unreported.retain(|nid| !failed.contains(nid));
        if event == Some(Event::Stopped) {
            tracing::info!("Left swarm {}", hex);
            return;
        }

        let interval = response
            .interval
            .unwrap_or(self.config.tracker.rerequest_interval);
        self.next_announce = now + Duration::from_secs(interval);
        tracing::info!(
            "Announced {}: {} neighbors, {} tracking codes, next in {}s",
            hex,
            response.peers.len(),
            response.tracking_codes.len(),
            interval
        );

        let plan = self.neighbors.plan(&self.overlay, &response.peers);
        for link in plan.close {
            self.overlay.close_link(link, now);
        }
        for dial in plan.dial {
            self.spawn_dial(dial);
        }
        neighbors::start_circuits(&mut self.overlay, info_hash, &response.tracking_codes, now);
    }

    /// Deliver overlay events, then move queued bytes to the writers
    fn pump(&mut self) {
        let mut disconnect = HashSet::new();
        while let Some(event) = self.overlay.poll_event() {
            match event {
                OverlayEvent::LinkOpened { nid, .. } => self.neighbors.link_opened(nid),
                OverlayEvent::LinkClosed { link, .. } => {
                    self.neighbors.link_closed(link);
                    if let Some(io) = self.links.remove(&link) {
                        io.close();
                    }
                }
                OverlayEvent::Disconnect { link } => {
                    disconnect.insert(link);
                }
                OverlayEvent::EndpointOpened {
                    stream,
                    info_hash,
                    initiator,
                } => self.notify(AppEvent::Opened {
                    stream,
                    info_hash,
                    initiator,
                }),
                OverlayEvent::EndpointClosed { stream, info_hash } => {
                    self.notify(AppEvent::Closed { stream, info_hash })
                }
                OverlayEvent::Transfer {
                    stream,
                    info_hash,
                    message,
                } => self.notify(AppEvent::Message {
                    stream,
                    info_hash,
                    message,
                }),
            }
        }

        let now = Instant::now();
        for (&id, io) in &self.links {
            loop {
                let in_flight = io.in_flight.load(Ordering::Acquire);
                if in_flight >= WRITE_WINDOW {
                    break;
                }
                let budget = self.limiter.available(now).min(WRITE_WINDOW - in_flight);
                if budget == 0 {
                    break;
                }
                let Some(bytes) = self.overlay.poll_transmit(id, budget) else {
                    break;
                };
                self.limiter.consume(bytes.len());
                io.in_flight.fetch_add(bytes.len(), Ordering::AcqRel);
                let _ = io.writer.send(WriteOp::Data(bytes));
            }
            let paused = self.overlay.is_paused(id);
            io.pause.send_if_modified(|current| {
                let changed = *current != paused;
                *current = paused;
                changed
            });
        }

        for link in disconnect {
            if let Some(io) = self.links.get(&link) {
                let _ = io.writer.send(WriteOp::Close);
            }
        }
    }

    fn notify(&self, event: AppEvent) {
        if self.app.send(event).is_err() {
            tracing::debug!("No listener for stream events");
        }
    }

    async fn shutdown(mut self) {
        let infohashes: Vec<InfoHash> = self.overlay.swarms().iter().map(|(ih, _)| *ih).collect();
        for info_hash in infohashes {
            let request = self.announce_request(info_hash, Some(Event::Stopped), Vec::new());
            match tokio::time::timeout(STOP_ANNOUNCE_TIMEOUT, self.tracker.announce(&request)).await
            {
                Ok(Ok(_)) => tracing::info!("Sent stopped for {}", hash_to_hex(&info_hash)),
                Ok(Err(e)) => tracing::warn!("Stopped announce failed: {:#}", e),
                Err(_) => tracing::warn!("Stopped announce timed out"),
            }
        }
        for (_, io) in self.links.drain() {
            io.close();
        }
        tracing::info!("Peer stopped");
    }
}

async fn connect(
    connector: &TlsConnector,
    dial: &Dial,
) -> Result<(TlsStream<TcpStream>, SocketAddr)> {
    let tcp = TcpStream::connect((dial.host.as_str(), dial.port)).await?;
    let addr = tcp.peer_addr()?;
    tcp.set_nodelay(true)?;
    // Peers are authenticated by certificate fingerprint, not by name
    let stream = connector.connect(ServerName::from(addr.ip()), tcp).await?;
    Ok((TlsStream::from(stream), addr))
}

fn spawn_link_io(
    link: LinkId,
    stream: TlsStream<TcpStream>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
) -> LinkIo {
    let (mut rd, mut wr) = tokio::io::split(stream);
    let (writer, mut ops) = mpsc::unbounded_channel::<WriteOp>();
    let (pause, mut paused) = watch::channel(false);
    let in_flight = Arc::new(AtomicUsize::new(0));

    let reader_tx = net_tx.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            loop {
                let is_paused = *paused.borrow_and_update();
                if !is_paused {
                    break;
                }
                if paused.changed().await.is_err() {
                    return;
                }
            }
            match rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let bytes = buf[..n].to_vec();
                    if reader_tx.send(NetEvent::Data { link, bytes }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!("Read on link {} failed: {}", link, e);
                    break;
                }
            }
        }
        let _ = reader_tx.send(NetEvent::Closed { link });
    });

    let pending = in_flight.clone();
    tokio::spawn(async move {
        while let Some(op) = ops.recv().await {
            match op {
                WriteOp::Data(bytes) => {
                    let result = wr.write_all(&bytes).await;
                    pending.fetch_sub(bytes.len(), Ordering::AcqRel);
                    if let Err(e) = result {
                        tracing::debug!("Write on link {} failed: {}", link, e);
                        let _ = net_tx.send(NetEvent::Closed { link });
                        return;
                    }
                    let _ = net_tx.send(NetEvent::Written);
                }
                WriteOp::Close => {
                    let _ = wr.shutdown().await;
                    return;
                }
            }
        }
    });

    LinkIo {
        writer,
        pause,
        in_flight,
        reader,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_unlimited() {
        let mut limiter = RateLimiter::new(0);
        assert_eq!(limiter.available(Instant::now()), usize::MAX);
        limiter.consume(1 << 20);
        assert_eq!(limiter.available(Instant::now()), usize::MAX);
    }

    #[test]
    fn test_rate_limiter_refills() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(1000);
        limiter.last = start;
        assert_eq!(limiter.available(start), 1000);
        limiter.consume(1000);
        assert_eq!(limiter.available(start), 0);
        assert_eq!(limiter.available(start + Duration::from_millis(500)), 500);
        // Never more than one second of burst
        assert_eq!(limiter.available(start + Duration::from_secs(10)), 1000);
    }

    #[tokio::test]
    async fn test_peer_handle_reports_stopped_loop() {
        let (handle, rx) = PeerHandle::channel();
        drop(rx);
        assert!(handle.shutdown().is_err());
    }
}
