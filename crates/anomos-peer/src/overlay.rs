//! Sans-IO overlay engine
//!
//! [`Overlay`] owns every neighbor link and every stream of one peer. It never
//! touches a socket: the driver feeds it received bytes with
//! [`Overlay::receive`], drains outgoing bytes with [`Overlay::poll_transmit`]
//! and reacts to [`OverlayEvent`]s. Time is passed in explicitly so timeouts
//! can be tested without sleeping.
//!
//! Relay halves on different links refer to each other by [`StreamRef`]; a
//! link's teardown sends BREAK on the far half of every pair it carried.

use crate::config::NetworkConfig;
use crate::endpoint::{encrypted_payload, EndpointState, EndpointStream};
use crate::link::{Link, LinkId, LinkRole, Phase, Stream, StreamKind, StreamRef};
use crate::relay::{RelayHalf, RelayState};
use crate::swarm::SwarmTable;
use anomos_core::handshake::{handshake_bytes, HandshakeStatus};
use anomos_core::tcode::{self, Peeled};
use anomos_core::wire::{self, Message, MessageType};
use anomos_core::{
    hash_to_hex, CryptoContext, Error, Identity, InfoHash, Nid, PeerId, Result, SessionId,
    StreamId, StreamKey, TransferMessage,
};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CONFIRM_BODY: [u8; 1] = [MessageType::Confirm as u8];
static BREAK_BODY: [u8; 1] = [MessageType::Break as u8];
static ACKBREAK_BODY: [u8; 1] = [MessageType::AckBreak as u8];

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub max_message_length: usize,
    pub send_quantum: usize,
    pub relay_high_watermark: usize,
    pub relay_low_watermark: usize,
    pub socket_timeout: Duration,
    pub completion_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for OverlayConfig {
    fn from(net: &NetworkConfig) -> Self {
        Self {
            max_message_length: net.max_message_length,
            send_quantum: net.send_quantum,
            relay_high_watermark: net.relay_high_watermark,
            relay_low_watermark: net.relay_low_watermark,
            socket_timeout: net.socket_timeout(),
            completion_timeout: net.completion_timeout(),
            handshake_timeout: net.handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// Both handshakes done; the link carries streams now
    LinkOpened {
        link: LinkId,
        nid: Nid,
        peer_id: PeerId,
    },
    /// The link is gone from the overlay
    LinkClosed { link: LinkId, nid: Option<Nid> },
    /// Flush what is queued for the link, then close its socket
    Disconnect { link: LinkId },
    EndpointOpened {
        stream: StreamRef,
        info_hash: InfoHash,
        initiator: bool,
    },
    EndpointClosed {
        stream: StreamRef,
        info_hash: InfoHash,
    },
    Transfer {
        stream: StreamRef,
        info_hash: InfoHash,
        message: TransferMessage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub state: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStats {
    pub link: LinkId,
    pub nid: Option<Nid>,
    pub peer_id: PeerId,
    pub role: LinkRole,
    pub open: bool,
    pub paused: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub queued_bytes: usize,
    pub streams: Vec<StreamStats>,
}

/// Work parked until the link for a NID finishes its handshake
#[derive(Debug)]
enum Waiting {
    Relay {
        from: StreamRef,
        code: Vec<u8>,
    },
    Endpoint {
        info_hash: InfoHash,
        key: StreamKey,
        code: Vec<u8>,
        since: Instant,
    },
}

pub struct Overlay {
    ctx: Arc<CryptoContext>,
    identity: Arc<Identity>,
    local_id: PeerId,
    session_id: SessionId,
    config: OverlayConfig,
    links: HashMap<LinkId, Link>,
    next_link: LinkId,
    by_nid: HashMap<Nid, LinkId>,
    /// Certificate first seen for each NID
    pinned: HashMap<Nid, PeerId>,
    /// NIDs with a TCP or TLS connect in progress
    dialing: HashSet<Nid>,
    waiting: HashMap<Nid, Vec<Waiting>>,
    failed: BTreeSet<Nid>,
    swarms: SwarmTable,
    events: VecDeque<OverlayEvent>,
}

impl Overlay {
    pub fn new(
        ctx: Arc<CryptoContext>,
        identity: Arc<Identity>,
        session_id: SessionId,
        config: OverlayConfig,
    ) -> Self {
        let local_id = identity.peer_id();
        Self {
            ctx,
            identity,
            local_id,
            session_id,
            config,
            links: HashMap::new(),
            next_link: 0,
            by_nid: HashMap::new(),
            pinned: HashMap::new(),
            dialing: HashSet::new(),
            waiting: HashMap::new(),
            failed: BTreeSet::new(),
            swarms: SwarmTable::new(),
            events: VecDeque::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.local_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn swarms(&self) -> &SwarmTable {
        &self.swarms
    }

    pub fn swarms_mut(&mut self) -> &mut SwarmTable {
        &mut self.swarms
    }

    pub fn poll_event(&mut self) -> Option<OverlayEvent> {
        self.events.pop_front()
    }

    // Links

    /// Note that a connect to `nid` is under way, so tracking codes naming
    /// it are held instead of refused
    pub fn dialing(&mut self, nid: Nid) {
        self.dialing.insert(nid);
    }

    /// A connect to `nid` failed before any link existed
    pub fn dial_failed(&mut self, nid: Nid, now: Instant) {
        if self.dialing.remove(&nid) && !self.by_nid.contains_key(&nid) {
            self.fail_dial(nid, now);
        }
    }

    /// Register a link we dialed once TLS is up; our handshake goes out first
    pub fn add_dialed_link(&mut self, nid: Nid, peer_id: PeerId, now: Instant) -> LinkId {
        let id = self.insert_link(LinkRole::Dialer, peer_id, Some(nid), now);
        if let Some(link) = self.links.get_mut(&id) {
            link.raw_out = handshake_bytes(nid);
        }
        self.dialing.remove(&nid);
        debug!("Link {} dialed to {} for NID {}", id, peer_id, nid);
        id
    }

    /// Register an accepted link; we answer once the remote handshake checks out
    pub fn add_accepted_link(&mut self, peer_id: PeerId, now: Instant) -> LinkId {
        let id = self.insert_link(LinkRole::Acceptor, peer_id, None, now);
        debug!("Link {} accepted from {}", id, peer_id);
        id
    }

    fn insert_link(
        &mut self,
        role: LinkRole,
        peer_id: PeerId,
        expected: Option<Nid>,
        now: Instant,
    ) -> LinkId {
        let id = self.next_link;
        self.next_link = self.next_link.wrapping_add(1);
        let link = Link::new(
            id,
            role,
            peer_id,
            expected,
            self.config.max_message_length,
            self.config.send_quantum,
            now,
        );
        self.links.insert(id, link);
        id
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    pub fn link_for(&self, nid: Nid) -> Option<LinkId> {
        self.by_nid.get(&nid).copied()
    }

    /// NIDs with an open link
    pub fn open_nids(&self) -> Vec<Nid> {
        self.by_nid.keys().copied().collect()
    }

    pub fn is_paused(&self, id: LinkId) -> bool {
        self.links.get(&id).is_some_and(Link::is_paused)
    }

    pub fn has_output(&self, id: LinkId) -> bool {
        self.links.get(&id).is_some_and(Link::has_output)
    }

    /// Neighbors we failed to reach since the last call
    pub fn take_failed(&mut self) -> Vec<Nid> {
        std::mem::take(&mut self.failed).into_iter().collect()
    }

    /// Close a link on our own initiative
    pub fn close_link(&mut self, id: LinkId, now: Instant) {
        self.teardown(id, true, now);
    }

    /// The driver lost the socket
    pub fn link_closed(&mut self, id: LinkId, now: Instant) {
        self.teardown(id, false, now);
    }

    /// Feed bytes read from a link. An error means the link was dropped.
    pub fn receive(&mut self, id: LinkId, data: &[u8], now: Instant) -> Result<()> {
        let Some(link) = self.links.get_mut(&id) else {
            return Ok(());
        };
        link.bytes_received += data.len() as u64;
        link.last_active = now;
        match self.process(id, data, now) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Dropping link {}: {}", id, e);
                self.teardown(id, true, now);
                Err(e)
            }
        }
    }

    /// Up to `budget` bytes to write to a link, handshake first
    pub fn poll_transmit(&mut self, id: LinkId, budget: usize) -> Option<Vec<u8>> {
        let link = self.links.get_mut(&id)?;
        let mut out = std::mem::take(&mut link.raw_out);
        if link.is_open() && out.len() < budget {
            let frames = link.queue.pop(budget - out.len());
            out.extend_from_slice(&frames);
        }
        if out.is_empty() {
            return None;
        }
        link.bytes_sent += out.len() as u64;
        self.resume_readers(id);
        Some(out)
    }

    /// Expire idle links, stalled handshakes and streams stuck in setup or close
    pub fn tick(&mut self, now: Instant) {
        let mut stale = Vec::new();
        let mut expired = Vec::new();
        for link in self.links.values() {
            if link.is_handshaking()
                && now.duration_since(link.created) > self.config.handshake_timeout
            {
                stale.push((link.id, "handshake timed out"));
                continue;
            }
            if link.is_open() && now.duration_since(link.last_active) > self.config.socket_timeout
            {
                stale.push((link.id, "idle"));
                continue;
            }
            for (sid, stream) in &link.streams {
                let (since, unsettled) = match stream {
                    Stream::Relay(half) => (half.since, half.state != RelayState::Established),
                    Stream::Endpoint(ep) => (ep.since, !ep.is_established()),
                };
                if unsettled && now.duration_since(since) > self.config.completion_timeout {
                    expired.push(StreamRef {
                        link: link.id,
                        stream: *sid,
                    });
                }
            }
        }

        for (id, why) in stale {
            info!("Closing link {}: {}", id, why);
            self.teardown(id, true, now);
        }
        for r in expired {
            let Some((kind, closing)) = self.stream_status(r) else {
                continue;
            };
            if closing {
                debug!("Giving up on ACKBREAK for {}", r);
                self.remove_stream(r);
            } else if kind == StreamKind::Relay {
                info!("Relay {} did not complete in time", r);
                self.close_relay(r, now);
            } else {
                info!("Endpoint {} did not complete in time", r);
                self.send_break(r, now);
            }
        }

        let timeout = self.config.completion_timeout;
        for waiters in self.waiting.values_mut() {
            waiters.retain(|w| match w {
                Waiting::Endpoint { since, .. } => now.duration_since(*since) <= timeout,
                Waiting::Relay { .. } => true,
            });
        }
        self.waiting.retain(|_, w| !w.is_empty());
    }

    // Endpoints

    /// Open a circuit with a tracking code the tracker issued to us.
    ///
    /// Returns `None` when the first hop is still connecting; the stream is
    /// created once its link opens.
    pub fn start_circuit(
        &mut self,
        info_hash: InfoHash,
        code: &[u8],
        key: StreamKey,
        now: Instant,
    ) -> Result<Option<StreamRef>> {
        if !self.swarms.contains(&info_hash) {
            return Err(Error::UnknownResource(hash_to_hex(&info_hash)));
        }
        match tcode::peel(&self.ctx, self.identity.private_key(), &self.session_id, code)? {
            Peeled::Terminal { .. } => Err(Error::Protocol(
                "tracking code ends at its own source".to_string(),
            )),
            Peeled::Relay { nid, next } => {
                if let Some(link) = self.link_for(nid) {
                    return self
                        .open_endpoint(link, info_hash, &key, &next, now)
                        .map(Some);
                }
                if self.is_dialing(nid) {
                    debug!("Circuit for {} waits for NID {}", hash_to_hex(&info_hash), nid);
                    self.waiting.entry(nid).or_default().push(Waiting::Endpoint {
                        info_hash,
                        key,
                        code: next,
                        since: now,
                    });
                    return Ok(None);
                }
                Err(Error::Unreachable(format!("no link for NID {}", nid)))
            }
        }
    }

    /// Encrypt and queue a transfer message on an established endpoint
    pub fn send_transfer(&mut self, r: StreamRef, msg: &TransferMessage) -> Result<()> {
        let Some(Stream::Endpoint(ep)) = self.stream_mut(r) else {
            return Err(Error::NotFound(format!("endpoint stream {}", r)));
        };
        if !ep.is_established() {
            return Err(Error::Protocol(format!(
                "endpoint {} is {}",
                r,
                ep.state.name()
            )));
        }
        let body = ep.seal(msg)?;
        self.push(r, body);
        Ok(())
    }

    pub fn close_endpoint(&mut self, r: StreamRef, now: Instant) {
        if matches!(self.stream_status(r), Some((StreamKind::Endpoint, false))) {
            info!("Closing endpoint {}", r);
            self.send_break(r, now);
        }
    }

    pub fn snapshot(&self) -> Vec<LinkStats> {
        let mut stats: Vec<LinkStats> = self
            .links
            .values()
            .map(|l| {
                let mut streams: Vec<StreamStats> = l
                    .streams
                    .iter()
                    .map(|(id, s)| StreamStats {
                        stream_id: *id,
                        kind: s.kind(),
                        state: s.state_name(),
                    })
                    .collect();
                streams.sort_by_key(|s| s.stream_id);
                LinkStats {
                    link: l.id,
                    nid: l.nid,
                    peer_id: l.peer_id,
                    role: l.role,
                    open: l.is_open(),
                    paused: l.is_paused(),
                    bytes_sent: l.bytes_sent,
                    bytes_received: l.bytes_received,
                    queued_bytes: l.queue.queued_bytes(),
                    streams,
                }
            })
            .collect();
        stats.sort_by_key(|s| s.link);
        stats
    }

    // Inbound processing

    fn process(&mut self, id: LinkId, data: &[u8], now: Instant) -> Result<()> {
        let handshake = {
            let Some(link) = self.links.get_mut(&id) else {
                return Ok(());
            };
            match &mut link.phase {
                Phase::Draining => return Ok(()),
                Phase::Open => None,
                Phase::Handshaking(reader) => match reader.feed(data)? {
                    HandshakeStatus::Pending => return Ok(()),
                    HandshakeStatus::Complete { nid, rest } => Some((nid, rest)),
                },
            }
        };

        let frames = match handshake {
            Some((nid, rest)) => {
                self.on_handshake(id, nid, now)?;
                match self.links.get_mut(&id) {
                    Some(link) if link.is_open() => link.reader.feed(&rest)?,
                    _ => return Ok(()),
                }
            }
            None => match self.links.get_mut(&id) {
                Some(link) => link.reader.feed(data)?,
                None => return Ok(()),
            },
        };

        for frame in frames {
            if !self.links.get(&id).is_some_and(Link::is_open) {
                break;
            }
            self.on_frame(id, frame.stream_id, frame.body, now)?;
        }
        Ok(())
    }

    fn on_handshake(&mut self, id: LinkId, nid: Nid, now: Instant) -> Result<()> {
        let Some(link) = self.links.get_mut(&id) else {
            return Ok(());
        };

        if nid.is_nat_check() {
            if link.role == LinkRole::Dialer {
                return Err(Error::Handshake(
                    "reachability NID on a dialed link".to_string(),
                ));
            }
            link.raw_out.extend_from_slice(&handshake_bytes(nid));
            link.phase = Phase::Draining;
            info!("Answered reachability probe from {}", link.peer_id);
            self.events.push_back(OverlayEvent::Disconnect { link: id });
            return Ok(());
        }

        match self.pinned.get(&nid) {
            Some(pinned) if *pinned != link.peer_id => {
                return Err(Error::Handshake(format!(
                    "NID {} belongs to {}, link presented {}",
                    nid, pinned, link.peer_id
                )));
            }
            Some(_) => {}
            None => {
                self.pinned.insert(nid, link.peer_id);
            }
        }

        if link.role == LinkRole::Acceptor {
            link.raw_out.extend_from_slice(&handshake_bytes(nid));
        }
        link.nid = Some(nid);
        link.phase = Phase::Open;
        let role = link.role;
        let peer_id = link.peer_id;

        if let Some(other) = self.link_for(nid) {
            // Both ends keep the link dialed by the smaller peer id
            let dialed_by_us = role == LinkRole::Dialer;
            if dialed_by_us == (self.local_id < peer_id) {
                info!("Link {} replaces duplicate {} for NID {}", id, other, nid);
                self.teardown(other, true, now);
            } else {
                info!("Dropping duplicate link {} for NID {}", id, nid);
                self.teardown(id, true, now);
                return Ok(());
            }
        }

        self.by_nid.insert(nid, id);
        self.dialing.remove(&nid);
        info!("Link {} open to {} as NID {}", id, peer_id, nid);
        self.events.push_back(OverlayEvent::LinkOpened {
            link: id,
            nid,
            peer_id,
        });
        self.flush_waiting(nid, id, now);
        Ok(())
    }

    fn on_frame(&mut self, id: LinkId, sid: StreamId, body: Bytes, now: Instant) -> Result<()> {
        let (body, msg) = match Message::parse(&body)? {
            Message::Partial {
                remaining,
                fragment,
            } => {
                let Some(link) = self.links.get_mut(&id) else {
                    return Ok(());
                };
                match link.reassembler.feed(sid, remaining, fragment)? {
                    Some(whole) => {
                        let msg = Message::parse(&whole)?;
                        (whole, msg)
                    }
                    None => return Ok(()),
                }
            }
            msg => (body, msg),
        };

        let r = StreamRef {
            link: id,
            stream: sid,
        };
        match self.stream_status(r).map(|(kind, _)| kind) {
            Some(StreamKind::Relay) => self.on_relay_message(r, body, msg, now),
            Some(StreamKind::Endpoint) => self.on_endpoint_message(r, msg, now),
            None => match msg {
                Message::TrackingCode(code) => self.on_tracking_code(r, &code, now),
                // Late answers to a stream both sides closed at once
                Message::Break | Message::AckBreak => {
                    debug!("{} for released stream {}", msg.name(), r);
                    Ok(())
                }
                Message::Unknown(code) => Err(Error::UnknownMessage(code)),
                other => Err(Error::Protocol(format!(
                    "{} on unknown stream {}",
                    other.name(),
                    sid
                ))),
            },
        }
    }

    fn on_tracking_code(&mut self, r: StreamRef, code: &[u8], now: Instant) -> Result<()> {
        if self
            .links
            .get(&r.link)
            .is_some_and(|l| l.is_local_id(r.stream))
        {
            return Err(Error::Protocol(format!(
                "remote opened stream {} with our parity",
                r.stream
            )));
        }

        match tcode::peel(&self.ctx, self.identity.private_key(), &self.session_id, code)? {
            Peeled::Relay { nid, next } => {
                self.insert_stream(r, Stream::Relay(RelayHalf::inbound(now)));
                debug!("Relay stream {} toward NID {}", r, nid);
                self.extend_relay(r, nid, next, now);
            }
            Peeled::Terminal { infohash, key } => {
                let served = self.swarms.num_pieces(&infohash);
                let mut ep = EndpointStream::new(infohash, served.unwrap_or(0), &key, false, now)?;
                if served.is_some() {
                    self.insert_stream(r, Stream::Endpoint(ep));
                    self.push(r, Bytes::from_static(&CONFIRM_BODY));
                    info!("Endpoint {} opened for {}", r, hash_to_hex(&infohash));
                    self.events.push_back(OverlayEvent::EndpointOpened {
                        stream: r,
                        info_hash: infohash,
                        initiator: false,
                    });
                } else {
                    warn!(
                        "Tracking code on {} for unserved swarm {}",
                        r,
                        hash_to_hex(&infohash)
                    );
                    ep.set_state(EndpointState::Closing, now);
                    ep.closed_notified = true;
                    self.insert_stream(r, Stream::Endpoint(ep));
                    self.push(r, Bytes::from_static(&BREAK_BODY));
                }
            }
        }
        Ok(())
    }

    fn on_relay_message(
        &mut self,
        r: StreamRef,
        body: Bytes,
        msg: Message,
        now: Instant,
    ) -> Result<()> {
        let Some(Stream::Relay(half)) = self.stream_mut(r) else {
            return Ok(());
        };
        let (state, partner, outbound) = (half.state, half.partner, half.outbound);

        match msg {
            Message::Confirm => {
                if matches!(state, RelayState::Closing | RelayState::Closed) {
                    // The next hop confirmed before our BREAK reached it
                    debug!("Late CONFIRM on closing relay {}", r);
                    return Ok(());
                }
                if !(outbound && state == RelayState::HalfOpenOut) {
                    return Err(Error::Protocol(format!(
                        "CONFIRM on relay {} in state {}",
                        r,
                        state.name()
                    )));
                }
                let Some(partner) = partner else {
                    return Ok(());
                };
                let from_next = self.establish_relay(r, now);
                let from_prev = self.establish_relay(partner, now);
                self.push(partner, Bytes::from_static(&CONFIRM_BODY));
                for held in from_next {
                    self.forward(r.link, partner, held);
                }
                for held in from_prev {
                    self.forward(partner.link, r, held);
                }
                debug!("Relay {} <-> {} established", partner, r);
            }
            Message::Relay(_) => match state {
                RelayState::Established => {
                    if let Some(partner) = partner {
                        self.forward(r.link, partner, body);
                    }
                }
                RelayState::HalfOpenIn | RelayState::HalfOpenOut => {
                    let limit = self.config.max_message_length;
                    let held = match self.stream_mut(r) {
                        Some(Stream::Relay(half)) => half.hold(body, limit),
                        _ => Ok(()),
                    };
                    if let Err(e) = held {
                        warn!("Closing relay {}: {}", r, e);
                        self.close_relay(r, now);
                    }
                }
                RelayState::Closing | RelayState::Closed => {}
            },
            Message::Break => {
                if state == RelayState::Closing {
                    self.push(r, Bytes::from_static(&ACKBREAK_BODY));
                    return Ok(());
                }
                self.remove_stream(r);
                self.push(r, Bytes::from_static(&ACKBREAK_BODY));
                debug!("Relay {} broken by remote", r);
                if let Some(partner) = partner {
                    self.send_break(partner, now);
                }
            }
            Message::AckBreak => {
                if state != RelayState::Closing {
                    return Err(Error::Protocol(format!("ACKBREAK on open relay {}", r)));
                }
                self.remove_stream(r);
            }
            Message::Unknown(code) => return Err(Error::UnknownMessage(code)),
            other => {
                return Err(Error::Protocol(format!(
                    "{} on relay stream {}",
                    other.name(),
                    r
                )))
            }
        }
        Ok(())
    }

    fn on_endpoint_message(&mut self, r: StreamRef, msg: Message, now: Instant) -> Result<()> {
        let Some(Stream::Endpoint(ep)) = self.stream_mut(r) else {
            return Ok(());
        };
        let (state, initiator, info_hash) = (ep.state, ep.initiator, ep.info_hash);

        match msg {
            Message::Confirm => {
                if initiator && state == EndpointState::Initiating {
                    if let Some(Stream::Endpoint(ep)) = self.stream_mut(r) {
                        ep.set_state(EndpointState::Established, now);
                    }
                    info!("Endpoint {} established for {}", r, hash_to_hex(&info_hash));
                    self.events.push_back(OverlayEvent::EndpointOpened {
                        stream: r,
                        info_hash,
                        initiator: true,
                    });
                } else if state != EndpointState::Closing {
                    warn!("Unexpected CONFIRM on endpoint {}", r);
                    self.send_break(r, now);
                }
            }
            Message::Relay(payload) => match encrypted_payload(&payload) {
                Some(ciphertext) => self.on_encrypted(r, state, ciphertext, now),
                None => {
                    warn!("RELAY without an ENCRYPTED envelope on endpoint {}", r);
                    self.send_break(r, now);
                }
            },
            Message::Encrypted(ciphertext) => self.on_encrypted(r, state, &ciphertext, now),
            Message::Break => {
                if state == EndpointState::Closing {
                    self.push(r, Bytes::from_static(&ACKBREAK_BODY));
                    return Ok(());
                }
                if let Some(Stream::Endpoint(ep)) = self.remove_stream(r) {
                    if !ep.closed_notified {
                        self.events.push_back(OverlayEvent::EndpointClosed {
                            stream: r,
                            info_hash,
                        });
                    }
                }
                self.push(r, Bytes::from_static(&ACKBREAK_BODY));
                info!("Endpoint {} closed by remote", r);
            }
            Message::AckBreak => {
                if state != EndpointState::Closing {
                    return Err(Error::Protocol(format!("ACKBREAK on open endpoint {}", r)));
                }
                self.remove_stream(r);
            }
            Message::Unknown(code) => return Err(Error::UnknownMessage(code)),
            other => {
                return Err(Error::Protocol(format!(
                    "{} on endpoint stream {}",
                    other.name(),
                    r
                )))
            }
        }
        Ok(())
    }

    fn on_encrypted(&mut self, r: StreamRef, state: EndpointState, ciphertext: &[u8], now: Instant) {
        match state {
            EndpointState::Established => {}
            EndpointState::Closing | EndpointState::Closed => return,
            EndpointState::Initiating => {
                warn!("Data before CONFIRM on endpoint {}", r);
                self.send_break(r, now);
                return;
            }
        }
        let opened = match self.stream_mut(r) {
            Some(Stream::Endpoint(ep)) => ep.open(ciphertext).map(|m| (ep.info_hash, m)),
            _ => return,
        };
        match opened {
            Ok((info_hash, message)) => self.events.push_back(OverlayEvent::Transfer {
                stream: r,
                info_hash,
                message,
            }),
            Err(e) => {
                warn!("Closing endpoint {}: {}", r, e);
                self.send_break(r, now);
            }
        }
    }

    // Relay plumbing

    fn extend_relay(&mut self, inbound: StreamRef, nid: Nid, code: Vec<u8>, now: Instant) {
        match self.link_for(nid) {
            Some(out_link) if out_link != inbound.link => {
                self.open_relay_out(inbound, out_link, code, now);
                return;
            }
            Some(_) => debug!("Tracking code on {} points back over its own link", inbound),
            None if self.is_dialing(nid) => {
                debug!("Holding relay {} until NID {} opens", inbound, nid);
                self.waiting
                    .entry(nid)
                    .or_default()
                    .push(Waiting::Relay {
                        from: inbound,
                        code,
                    });
                return;
            }
            None => debug!("No link for NID {} named on {}", nid, inbound),
        }
        self.send_break(inbound, now);
    }

    fn open_relay_out(&mut self, inbound: StreamRef, out_link: LinkId, code: Vec<u8>, now: Instant) {
        let allocated = self
            .links
            .get(&out_link)
            .and_then(Link::allocate_stream_id);
        let Some(sid) = allocated else {
            warn!("No stream id free on link {} for relay {}", out_link, inbound);
            self.send_break(inbound, now);
            return;
        };
        let out = StreamRef {
            link: out_link,
            stream: sid,
        };
        self.insert_stream(out, Stream::Relay(RelayHalf::outbound(inbound, now)));
        self.push(
            out,
            Bytes::from(wire::body(MessageType::TrackingCode, &code)),
        );
        if let Some(Stream::Relay(half)) = self.stream_mut(inbound) {
            half.partner = Some(out);
            half.set_state(RelayState::HalfOpenOut, now);
        }
        debug!("Relay {} -> {} sent TCODE", inbound, out);
    }

    fn establish_relay(&mut self, r: StreamRef, now: Instant) -> Vec<Bytes> {
        match self.stream_mut(r) {
            Some(Stream::Relay(half)) => {
                half.set_state(RelayState::Established, now);
                half.take_held()
            }
            _ => Vec::new(),
        }
    }

    fn forward(&mut self, from_link: LinkId, to: StreamRef, body: Bytes) {
        let high = self.config.relay_high_watermark;
        let Some(link) = self.links.get_mut(&to.link) else {
            return;
        };
        link.queue.push(to.stream, body);
        if link.queue.queued_bytes() <= high || from_link == to.link {
            return;
        }
        if let Some(from) = self.links.get_mut(&from_link) {
            if from.blocked_on.insert(to.link) && from.blocked_on.len() == 1 {
                debug!("Pausing reads on link {}: link {} is backed up", from_link, to.link);
            }
        }
    }

    /// Local close of one relay half and its partner
    fn close_relay(&mut self, r: StreamRef, now: Instant) {
        let partner = match self.stream_mut(r) {
            Some(Stream::Relay(half)) => half.partner,
            _ => None,
        };
        self.send_break(r, now);
        if let Some(partner) = partner {
            self.send_break(partner, now);
        }
    }

    /// Send BREAK on a stream and wait for ACKBREAK
    fn send_break(&mut self, r: StreamRef, now: Instant) {
        let Some(link) = self.links.get_mut(&r.link) else {
            return;
        };
        let Some(stream) = link.streams.get_mut(&r.stream) else {
            return;
        };
        match stream {
            Stream::Relay(half) => {
                if half.is_closing() {
                    return;
                }
                half.discard_held();
                half.partner = None;
                half.set_state(RelayState::Closing, now);
            }
            Stream::Endpoint(ep) => {
                if ep.is_closing() {
                    return;
                }
                ep.set_state(EndpointState::Closing, now);
                if !ep.closed_notified {
                    ep.closed_notified = true;
                    self.events.push_back(OverlayEvent::EndpointClosed {
                        stream: r,
                        info_hash: ep.info_hash,
                    });
                }
            }
        }
        link.queue.push(r.stream, Bytes::from_static(&BREAK_BODY));
        self.forget_waiting(r);
        debug!("BREAK sent on {}", r);
    }

    // Bookkeeping

    fn is_dialing(&self, nid: Nid) -> bool {
        self.dialing.contains(&nid)
            || self
                .links
                .values()
                .any(|l| l.is_handshaking() && l.role == LinkRole::Dialer && l.nid == Some(nid))
    }

    fn fail_dial(&mut self, nid: Nid, now: Instant) {
        info!("Neighbor NID {} unreachable", nid);
        self.failed.insert(nid);
        for waiter in self.waiting.remove(&nid).unwrap_or_default() {
            match waiter {
                Waiting::Relay { from, .. } => self.send_break(from, now),
                Waiting::Endpoint { info_hash, .. } => warn!(
                    "Dropping circuit for {}: first hop unreachable",
                    hash_to_hex(&info_hash)
                ),
            }
        }
    }

    fn flush_waiting(&mut self, nid: Nid, link: LinkId, now: Instant) {
        for waiter in self.waiting.remove(&nid).unwrap_or_default() {
            match waiter {
                Waiting::Relay { from, code } => {
                    let ready = matches!(
                        self.stream_mut(from),
                        Some(Stream::Relay(half))
                            if half.state == RelayState::HalfOpenIn && half.partner.is_none()
                    );
                    if !ready {
                        continue;
                    }
                    if from.link == link {
                        self.send_break(from, now);
                    } else {
                        self.open_relay_out(from, link, code, now);
                    }
                }
                Waiting::Endpoint {
                    info_hash,
                    key,
                    code,
                    ..
                } => {
                    if let Err(e) = self.open_endpoint(link, info_hash, &key, &code, now) {
                        warn!("Circuit for {} not started: {}", hash_to_hex(&info_hash), e);
                    }
                }
            }
        }
    }

    fn forget_waiting(&mut self, r: StreamRef) {
        for waiters in self.waiting.values_mut() {
            waiters.retain(|w| !matches!(w, Waiting::Relay { from, .. } if *from == r));
        }
    }

    fn open_endpoint(
        &mut self,
        link_id: LinkId,
        info_hash: InfoHash,
        key: &StreamKey,
        code: &[u8],
        now: Instant,
    ) -> Result<StreamRef> {
        let num_pieces = self
            .swarms
            .num_pieces(&info_hash)
            .ok_or_else(|| Error::UnknownResource(hash_to_hex(&info_hash)))?;
        let link = self
            .links
            .get_mut(&link_id)
            .ok_or_else(|| Error::NotFound(format!("link {}", link_id)))?;
        let sid = link
            .allocate_stream_id()
            .ok_or_else(|| Error::Transient(format!("no stream id free on link {}", link_id)))?;
        let ep = EndpointStream::new(info_hash, num_pieces, key, true, now)?;
        link.streams.insert(sid, Stream::Endpoint(ep));
        link.queue
            .push(sid, Bytes::from(wire::body(MessageType::TrackingCode, code)));
        let r = StreamRef {
            link: link_id,
            stream: sid,
        };
        debug!("Circuit for {} started on {}", hash_to_hex(&info_hash), r);
        Ok(r)
    }

    fn teardown(&mut self, id: LinkId, disconnect: bool, now: Instant) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        let nid = link.nid;
        if let Some(nid) = nid {
            if self.by_nid.get(&nid) == Some(&id) {
                self.by_nid.remove(&nid);
            }
            if link.is_handshaking()
                && link.role == LinkRole::Dialer
                && !self.by_nid.contains_key(&nid)
            {
                self.fail_dial(nid, now);
            }
        }
        info!(
            "Link {} closed (NID {:?}, {} bytes in, {} bytes out)",
            id, nid, link.bytes_received, link.bytes_sent
        );

        for (sid, stream) in link.streams {
            let r = StreamRef {
                link: id,
                stream: sid,
            };
            match stream {
                Stream::Relay(half) => {
                    if let Some(partner) = half.partner {
                        self.send_break(partner, now);
                    }
                }
                Stream::Endpoint(ep) => {
                    if !ep.closed_notified {
                        self.events.push_back(OverlayEvent::EndpointClosed {
                            stream: r,
                            info_hash: ep.info_hash,
                        });
                    }
                }
            }
            self.forget_waiting(r);
        }
        for other in self.links.values_mut() {
            other.blocked_on.remove(&id);
        }

        self.events.push_back(OverlayEvent::LinkClosed { link: id, nid });
        if disconnect {
            self.events.push_back(OverlayEvent::Disconnect { link: id });
        }
    }

    fn stream_mut(&mut self, r: StreamRef) -> Option<&mut Stream> {
        self.links.get_mut(&r.link)?.streams.get_mut(&r.stream)
    }

    /// Kind of a stream and whether it is already closing
    fn stream_status(&self, r: StreamRef) -> Option<(StreamKind, bool)> {
        let stream = self.links.get(&r.link)?.streams.get(&r.stream)?;
        let closing = match stream {
            Stream::Relay(half) => half.is_closing(),
            Stream::Endpoint(ep) => ep.is_closing(),
        };
        Some((stream.kind(), closing))
    }

    fn insert_stream(&mut self, r: StreamRef, stream: Stream) {
        if let Some(link) = self.links.get_mut(&r.link) {
            link.streams.insert(r.stream, stream);
        }
    }

    /// Release a stream id. Frames still queued for it and not yet started
    /// are dropped; a fragment already on the wire is finished.
    fn remove_stream(&mut self, r: StreamRef) -> Option<Stream> {
        let link = self.links.get_mut(&r.link)?;
        link.reassembler.forget(r.stream);
        link.queue.discard_unsent(r.stream);
        let stream = link.streams.remove(&r.stream);
        self.forget_waiting(r);
        self.resume_readers(r.link);
        stream
    }

    /// Let links paused behind `id` read again once it has drained
    fn resume_readers(&mut self, id: LinkId) {
        let drained = self
            .links
            .get(&id)
            .is_some_and(|l| l.queue.queued_bytes() <= self.config.relay_low_watermark);
        if !drained {
            return;
        }
        for other in self.links.values_mut() {
            if other.blocked_on.remove(&id) && other.blocked_on.is_empty() {
                debug!("Resuming reads on link {}", other.id);
            }
        }
    }

    fn push(&mut self, r: StreamRef, body: Bytes) {
        if let Some(link) = self.links.get_mut(&r.link) {
            link.queue.push(r.stream, body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anomos_core::handshake::HANDSHAKE_LEN;
    use anomos_core::testing::test_identity;
    use anomos_core::wire::encode_frame;

    fn overlay(index: usize) -> Overlay {
        let ctx = Arc::new(CryptoContext::from_seed([index as u8; 32]));
        let session = ctx.session_id();
        Overlay::new(
            ctx,
            Arc::new(test_identity(index)),
            session,
            OverlayConfig::default(),
        )
    }

    fn drain_events(o: &mut Overlay) -> Vec<OverlayEvent> {
        std::iter::from_fn(|| o.poll_event()).collect()
    }

    /// Move bytes both ways until neither side has anything to send
    fn pump(a: &mut Overlay, la: LinkId, b: &mut Overlay, lb: LinkId, now: Instant) {
        loop {
            let mut moved = false;
            if let Some(bytes) = a.poll_transmit(la, usize::MAX) {
                let _ = b.receive(lb, &bytes, now);
                moved = true;
            }
            if let Some(bytes) = b.poll_transmit(lb, usize::MAX) {
                let _ = a.receive(la, &bytes, now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn connect(a: &mut Overlay, b: &mut Overlay, nid: Nid, now: Instant) -> (LinkId, LinkId) {
        let la = a.add_dialed_link(nid, b.peer_id(), now);
        let lb = b.add_accepted_link(a.peer_id(), now);
        pump(a, la, b, lb, now);
        (la, lb)
    }

    #[test]
    fn test_handshake_opens_both_ends() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (la, lb) = connect(&mut a, &mut b, Nid(7), now);

        assert_eq!(a.link_for(Nid(7)), Some(la));
        assert_eq!(b.link_for(Nid(7)), Some(lb));
        assert_eq!(
            drain_events(&mut a),
            vec![OverlayEvent::LinkOpened {
                link: la,
                nid: Nid(7),
                peer_id: b.peer_id()
            }]
        );
        assert!(matches!(
            drain_events(&mut b)[..],
            [OverlayEvent::LinkOpened { nid: Nid(7), .. }]
        ));
    }

    #[test]
    fn test_nid_mismatch_aborts() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let la = a.add_dialed_link(Nid(7), b.peer_id(), now);
        let lb = b.add_accepted_link(a.peer_id(), now);

        // The acceptor answers with whatever NID arrived; flip it on the way back
        let hs = a.poll_transmit(la, usize::MAX).unwrap();
        b.receive(lb, &hs, now).unwrap();
        let mut reply = b.poll_transmit(lb, usize::MAX).unwrap();
        reply[HANDSHAKE_LEN - 8] ^= 1;
        assert!(a.receive(la, &reply, now).is_err());
        assert!(a.link(la).is_none());
        assert_eq!(a.take_failed(), vec![Nid(7)]);
    }

    #[test]
    fn test_nat_probe_answered_then_closed() {
        let now = Instant::now();
        let mut a = overlay(0);
        let link = a.add_accepted_link(test_identity(5).peer_id(), now);
        a.receive(link, &handshake_bytes(Nid::NAT_CHECK), now).unwrap();
        assert_eq!(
            a.poll_transmit(link, usize::MAX).unwrap(),
            handshake_bytes(Nid::NAT_CHECK)
        );
        assert_eq!(drain_events(&mut a), vec![OverlayEvent::Disconnect { link }]);
        assert!(a.link_for(Nid::NAT_CHECK).is_none());
    }

    #[test]
    fn test_pinned_identity_enforced() {
        let now = Instant::now();
        let (mut a, mut b, mut c) = (overlay(0), overlay(1), overlay(2));
        let (la, _) = connect(&mut a, &mut b, Nid(3), now);
        a.close_link(la, now);

        // Someone else shows up claiming NID 3
        let lc = c.add_dialed_link(Nid(3), a.peer_id(), now);
        let la2 = a.add_accepted_link(c.peer_id(), now);
        let hs = c.poll_transmit(lc, usize::MAX).unwrap();
        assert!(matches!(a.receive(la2, &hs, now), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_duplicate_links_resolved_the_same_way() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (a1, b1) = connect(&mut a, &mut b, Nid(4), now);
        let b2 = b.add_dialed_link(Nid(4), a.peer_id(), now);
        let a2 = a.add_accepted_link(b.peer_id(), now);
        pump(&mut b, b2, &mut a, a2, now);

        let keep_first = a.peer_id() < b.peer_id();
        let (a_keep, b_keep) = if keep_first { (a1, b1) } else { (a2, b2) };
        assert_eq!(a.link_for(Nid(4)), Some(a_keep));
        assert_eq!(b.link_for(Nid(4)), Some(b_keep));
    }

    #[test]
    fn test_unknown_stream_must_start_with_tcode() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (_, lb) = connect(&mut a, &mut b, Nid(1), now);
        let frame = encode_frame(0, &[MessageType::Confirm as u8]);
        assert!(b.receive(lb, &frame, now).is_err());
        assert!(b.link(lb).is_none());
        assert!(b.link_for(Nid(1)).is_none());
    }

    #[test]
    fn test_oversize_frame_drops_link() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (_, lb) = connect(&mut a, &mut b, Nid(1), now);
        drain_events(&mut b);

        let mut header = vec![0u8, 0];
        header.extend_from_slice(&(9u32 * 1024 * 1024).to_be_bytes());
        assert!(matches!(
            b.receive(lb, &header, now),
            Err(Error::Oversize { .. })
        ));
        let events = drain_events(&mut b);
        assert!(events.contains(&OverlayEvent::LinkClosed {
            link: lb,
            nid: Some(Nid(1))
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, OverlayEvent::Transfer { .. })));
    }

    #[test]
    fn test_remote_parity_enforced() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (_, lb) = connect(&mut a, &mut b, Nid(1), now);
        // The acceptor owns odd ids; a TCODE from the dialer on 1 is invalid
        let frame = encode_frame(1, &wire::body(MessageType::TrackingCode, &[0u8; 64]));
        assert!(matches!(b.receive(lb, &frame, now), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_idle_link_expires() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (la, _) = connect(&mut a, &mut b, Nid(1), now);
        drain_events(&mut a);
        a.tick(now + Duration::from_secs(10));
        assert!(a.link(la).is_some());
        a.tick(now + Duration::from_secs(301));
        assert!(a.link(la).is_none());
        assert!(drain_events(&mut a).contains(&OverlayEvent::Disconnect { link: la }));
    }

    #[test]
    fn test_stalled_handshake_expires() {
        let now = Instant::now();
        let mut a = overlay(0);
        let la = a.add_dialed_link(Nid(2), test_identity(1).peer_id(), now);
        a.tick(now + Duration::from_secs(31));
        assert!(a.link(la).is_none());
        assert_eq!(a.take_failed(), vec![Nid(2)]);
        assert!(a.take_failed().is_empty());
    }

    #[test]
    fn test_snapshot_counts_bytes() {
        let now = Instant::now();
        let (mut a, mut b) = (overlay(0), overlay(1));
        let (la, _) = connect(&mut a, &mut b, Nid(9), now);
        let stats = a.snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].link, la);
        assert_eq!(stats[0].nid, Some(Nid(9)));
        assert!(stats[0].open);
        assert_eq!(stats[0].bytes_sent, HANDSHAKE_LEN as u64);
        assert_eq!(stats[0].bytes_received, HANDSHAKE_LEN as u64);
        assert!(stats[0].streams.is_empty());
    }
}
