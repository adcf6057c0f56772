//! Peer registry and neighbor graph
//!
//! Every edge carries one NID that both endpoints use for each other, so the
//! tracker can name either side of an edge with the same byte when it writes
//! a tracking code.

use crate::{GraphError, Result};
use anomos_core::{InfoHash, Nid, PeerCertificate, PeerId, SessionId};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Highest NID issued for an edge; 0xFF belongs to the NAT probe
const MAX_EDGE_NID: u8 = Nid::NAT_CHECK.0 - 1;

/// Outcome of the inbound reachability probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatState {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// Transfer counters a peer reports for one swarm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// One edge as seen from one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub nid: Nid,
    pub addr: SocketAddr,
}

/// Everything the tracker knows about one peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub certificate: PeerCertificate,
    /// Address neighbors should dial (announced IP plus listen port)
    pub addr: SocketAddr,
    pub session_id: SessionId,
    pub last_seen: u64,
    pub swarms: HashMap<InfoHash, Progress>,
    nat: NatState,
    nat_probes: u32,
    neighbors: HashMap<PeerId, Neighbor>,
    id_map: HashMap<Nid, PeerId>,
    failed: HashSet<PeerId>,
}

impl PeerRecord {
    pub fn new(
        certificate: PeerCertificate,
        addr: SocketAddr,
        session_id: SessionId,
        now: u64,
    ) -> Self {
        Self {
            peer_id: certificate.peer_id(),
            certificate,
            addr,
            session_id,
            last_seen: now,
            swarms: HashMap::new(),
            nat: NatState::Unknown,
            nat_probes: 0,
            neighbors: HashMap::new(),
            id_map: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// Restore a record whose NAT verdict was persisted
    pub fn with_nat(mut self, nat: NatState, probes: u32) -> Self {
        self.nat = nat;
        self.nat_probes = probes;
        self
    }

    pub fn nat(&self) -> NatState {
        self.nat
    }

    pub fn nat_probes(&self) -> u32 {
        self.nat_probes
    }

    pub fn nid_for(&self, peer: &PeerId) -> Option<Nid> {
        self.neighbors.get(peer).map(|n| n.nid)
    }

    pub fn peer_for(&self, nid: Nid) -> Option<PeerId> {
        self.id_map.get(&nid).copied()
    }

    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.contains_key(peer)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = (&PeerId, &Neighbor)> {
        self.neighbors.iter()
    }

    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }

    pub fn has_reported_failed(&self, peer: &PeerId) -> bool {
        self.failed.contains(peer)
    }

    pub fn nid_in_use(&self, nid: Nid) -> bool {
        self.id_map.contains_key(&nid)
    }

    fn add_neighbor(&mut self, peer: PeerId, nid: Nid, addr: SocketAddr) {
        self.neighbors.insert(peer, Neighbor { nid, addr });
        self.id_map.insert(nid, peer);
    }

    fn remove_neighbor(&mut self, peer: &PeerId) -> Option<Nid> {
        let neighbor = self.neighbors.remove(peer)?;
        self.id_map.remove(&neighbor.nid);
        Some(neighbor.nid)
    }
}

/// Smallest k with k³ ≥ n
fn cube_root_ceil(n: usize) -> usize {
    let mut k = 0usize;
    while k.saturating_mul(k).saturating_mul(k) < n {
        k += 1;
    }
    k
}

/// The tracker's view of the overlay
#[derive(Debug, Default)]
pub struct NetworkModel {
    peers: HashMap<PeerId, PeerRecord>,
    reachable: HashSet<PeerId>,
}

impl NetworkModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    /// Mutable access for counters; edges and NAT state go through the model
    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn reachable_len(&self) -> usize {
        self.reachable.len()
    }

    pub fn is_reachable(&self, peer: &PeerId) -> bool {
        self.reachable.contains(peer)
    }

    /// Add a peer, replacing (and disconnecting) any previous record
    pub fn insert(&mut self, record: PeerRecord) {
        let id = record.peer_id;
        if self.peers.contains_key(&id) {
            self.disconnect_all(&id);
        }
        if record.nat == NatState::Reachable {
            self.reachable.insert(id);
        } else {
            self.reachable.remove(&id);
        }
        debug!("Registered peer {} at {}", id, record.addr);
        self.peers.insert(id, record);
    }

    /// A fresh run of a known peer: new session, no edges
    pub fn reset_session(&mut self, peer: &PeerId, session_id: SessionId) -> Result<()> {
        self.disconnect_all(peer);
        let record = self
            .peers
            .get_mut(peer)
            .ok_or(GraphError::UnknownPeer(*peer))?;
        record.session_id = session_id;
        record.failed.clear();
        Ok(())
    }

    /// Record a new dial address. A changed address invalidates the NAT
    /// verdict. Returns whether the address changed.
    pub fn update_address(&mut self, peer: &PeerId, addr: SocketAddr) -> Result<bool> {
        let record = self
            .peers
            .get_mut(peer)
            .ok_or(GraphError::UnknownPeer(*peer))?;
        if record.addr == addr {
            return Ok(false);
        }
        info!("Peer {} moved from {} to {}", peer, record.addr, addr);
        record.addr = addr;
        record.nat = NatState::Unknown;
        record.nat_probes = 0;
        let neighbors: Vec<PeerId> = record.neighbors.keys().copied().collect();
        self.reachable.remove(peer);
        for other in neighbors {
            if let Some(n) = self
                .peers
                .get_mut(&other)
                .and_then(|r| r.neighbors.get_mut(peer))
            {
                n.addr = addr;
            }
        }
        Ok(true)
    }

    /// Count one more NAT probe attempt; returns the new count
    pub fn record_probe(&mut self, peer: &PeerId) -> Result<u32> {
        let record = self
            .peers
            .get_mut(peer)
            .ok_or(GraphError::UnknownPeer(*peer))?;
        record.nat_probes += 1;
        Ok(record.nat_probes)
    }

    pub fn set_nat_verdict(&mut self, peer: &PeerId, reachable: bool) -> Result<()> {
        let record = self
            .peers
            .get_mut(peer)
            .ok_or(GraphError::UnknownPeer(*peer))?;
        if reachable {
            record.nat = NatState::Reachable;
            self.reachable.insert(*peer);
        } else {
            record.nat = NatState::Unreachable;
            self.reachable.remove(peer);
        }
        Ok(())
    }

    /// Install a symmetric edge under a NID free on both sides.
    ///
    /// When no NID is free on both peers nothing is changed; this should not
    /// happen in an honest network and may indicate someone is trying to
    /// exhaust a victim's NID space.
    pub fn connect<R: Rng>(&mut self, rng: &mut R, a: &PeerId, b: &PeerId) -> Result<Nid> {
        let pa = self.peers.get(a).ok_or(GraphError::UnknownPeer(*a))?;
        let pb = self.peers.get(b).ok_or(GraphError::UnknownPeer(*b))?;
        if a == b || pa.is_neighbor(b) {
            return Err(GraphError::AlreadyNeighbors(*a, *b));
        }
        let free: Vec<Nid> = (0..=MAX_EDGE_NID)
            .map(Nid)
            .filter(|nid| !pa.nid_in_use(*nid) && !pb.nid_in_use(*nid))
            .collect();
        let Some(&nid) = free.choose(rng) else {
            warn!(
                "No NID free on both {} and {}; possible NID exhaustion attack",
                a, b
            );
            return Err(GraphError::NidExhausted(*a, *b));
        };
        let (addr_a, addr_b) = (pa.addr, pb.addr);
        if let Some(r) = self.peers.get_mut(a) {
            r.add_neighbor(*b, nid, addr_b);
        }
        if let Some(r) = self.peers.get_mut(b) {
            r.add_neighbor(*a, nid, addr_a);
        }
        debug!("Connected {} <-> {} as {}", a, b, nid);
        Ok(nid)
    }

    /// Remove the edge between `a` and `b`, returning its NID
    pub fn disconnect(&mut self, a: &PeerId, b: &PeerId) -> Option<Nid> {
        let nid = self.peers.get_mut(a)?.remove_neighbor(b);
        if let Some(r) = self.peers.get_mut(b) {
            r.remove_neighbor(a);
        }
        nid
    }

    pub fn disconnect_all(&mut self, peer: &PeerId) {
        let Some(record) = self.peers.get(peer) else {
            return;
        };
        let neighbors: Vec<PeerId> = record.neighbors.keys().copied().collect();
        for other in neighbors {
            self.disconnect(peer, &other);
        }
    }

    /// Drop the edges `peer` says it could not use; those neighbors are not
    /// offered to it again. Unknown NIDs are ignored. Returns edges removed.
    pub fn report_failed(&mut self, peer: &PeerId, nids: &[Nid]) -> usize {
        let mut removed = 0;
        for nid in nids {
            let Some(other) = self.peers.get(peer).and_then(|r| r.peer_for(*nid)) else {
                continue;
            };
            self.disconnect(peer, &other);
            if let Some(r) = self.peers.get_mut(peer) {
                r.failed.insert(other);
            }
            debug!("{} reported neighbor {} ({}) as failed", peer, other, nid);
            removed += 1;
        }
        removed
    }

    /// Remove a peer and all of its edges
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.disconnect_all(peer);
        self.reachable.remove(peer);
        for record in self.peers.values_mut() {
            record.failed.remove(peer);
        }
        let record = self.peers.remove(peer)?;
        info!("Removed peer {}", peer);
        Some(record)
    }

    /// Target degree is the cube root of the reachable population
    pub fn nbrs_needed(&self, peer: &PeerId) -> usize {
        let degree = self.peers.get(peer).map_or(0, PeerRecord::degree);
        cube_root_ceil(self.reachable.len()).saturating_sub(degree)
    }

    /// Give a reachable peer as many new random neighbors as it needs.
    /// Returns the number of edges created.
    pub fn rand_connect<R: Rng>(&mut self, rng: &mut R, peer: &PeerId, allow_close: bool) -> usize {
        if !self.reachable.contains(peer) {
            return 0;
        }
        let needed = self.nbrs_needed(peer);
        if needed == 0 {
            return 0;
        }
        let Some(record) = self.peers.get(peer) else {
            return 0;
        };
        let ip = record.addr.ip();
        let mut candidates: Vec<PeerId> = self
            .reachable
            .iter()
            .filter(|c| *c != peer)
            .filter(|c| !record.is_neighbor(c) && !record.has_reported_failed(c))
            .filter(|c| {
                self.peers.get(*c).is_some_and(|r| {
                    !r.has_reported_failed(peer) && (allow_close || r.addr.ip() != ip)
                })
            })
            .copied()
            .collect();
        candidates.shuffle(rng);

        let mut made = 0;
        for candidate in candidates {
            if made == needed {
                break;
            }
            if self.connect(rng, peer, &candidate).is_ok() {
                made += 1;
            }
        }
        if made > 0 {
            debug!("Gave {} {} new neighbors ({} needed)", peer, made, needed);
        }
        made
    }

    /// Drop peers not seen since `cutoff`
    pub fn expire(&mut self, cutoff: u64) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| r.last_seen < cutoff)
            .map(|r| r.peer_id)
            .collect();
        for peer in &stale {
            self.remove(peer);
        }
        stale
    }

    /// Every edge carries the same NID at both ends
    pub fn is_symmetric(&self) -> bool {
        self.peers.values().all(|r| {
            r.neighbors.iter().all(|(other, n)| {
                self.peers
                    .get(other)
                    .and_then(|o| o.nid_for(&r.peer_id))
                    .is_some_and(|nid| nid == n.nid)
                    && r.id_map.get(&n.nid) == Some(other)
            })
        })
    }
}
