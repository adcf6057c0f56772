//! Tracker state and the announce handler
//!
//! [`Tracker`] owns the network model and the swarm registry. It does no
//! I/O of its own: the server feeds it parsed requests and carries out the
//! NAT probes it asks for.

use crate::config::Config;
use crate::{Result, TrackerError};
use anomos_core::announce::{AnnounceRequest, AnnounceResponse, Event, PeerEntry, ScrapeEntry, ScrapeResponse};
use anomos_core::{hash_to_hex, hex_to_hash, CryptoContext, InfoHash, PeerCertificate, PeerId, SessionId};
use anomos_graph::{issue_tracking_codes, GraphConfig, NatState, NetworkModel, PeerRecord, Progress, Swarm, SwarmRegistry};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NOT_AUTHORIZED: &str = "Requested download is not authorized for use with this tracker.";

/// Reachability check the server should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

/// Result of a successful announce
#[derive(Debug, Clone)]
pub struct Answer {
    pub response: AnnounceResponse,
    pub probe: Option<Probe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwarmStats {
    pub info_hash: String,
    pub seeders: usize,
    pub leechers: usize,
    pub completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub peers: usize,
    pub reachable: usize,
    pub probing: usize,
    pub swarms: Vec<SwarmStats>,
}

/// On-disk form of the tracker state. Edges are rebuilt by announces.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedState {
    peers: Vec<SavedPeer>,
    swarms: BTreeMap<String, Swarm>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedPeer {
    /// Hex DER
    certificate: String,
    addr: SocketAddr,
    session_id: SessionId,
    last_seen: u64,
    nat: NatState,
    nat_probes: u32,
    swarms: BTreeMap<String, Progress>,
}

pub struct Tracker {
    ctx: Arc<CryptoContext>,
    config: Config,
    graph: GraphConfig,
    model: NetworkModel,
    swarms: SwarmRegistry,
    blocked: HashSet<InfoHash>,
    /// Peers with a probe in flight
    probing: HashSet<PeerId>,
}

impl Tracker {
    pub fn new(ctx: Arc<CryptoContext>, config: Config, blocked: HashSet<InfoHash>) -> Self {
        Self {
            ctx,
            graph: config.graph(),
            config,
            model: NetworkModel::new(),
            swarms: SwarmRegistry::new(),
            blocked,
            probing: HashSet::new(),
        }
    }

    pub fn model(&self) -> &NetworkModel {
        &self.model
    }

    pub fn swarms(&self) -> &SwarmRegistry {
        &self.swarms
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle one announce from the holder of `certificate`, seen at `remote`
    pub fn announce(
        &mut self,
        request: &AnnounceRequest,
        certificate: &PeerCertificate,
        remote: IpAddr,
        now: u64,
    ) -> Result<Answer> {
        let info_hash = request.info_hash;
        if self.blocked.contains(&info_hash) {
            debug!("Refusing blocked infohash {}", hash_to_hex(&info_hash));
            return Err(TrackerError::Refused(NOT_AUTHORIZED.to_string()));
        }

        let peer_id = certificate.peer_id();
        let addr = SocketAddr::new(self.announced_ip(request, remote)?, request.port);

        match self.model.get(&peer_id) {
            Some(record) if record.certificate.der() != certificate.der() => {
                warn!(
                    "Peer {} from {} presented a different certificate; refusing",
                    peer_id, remote
                );
                return Err(TrackerError::Refused(
                    "certificate does not match the one registered for this peer".to_string(),
                ));
            }
            Some(_) => {
                if request.event == Some(Event::Started) {
                    let session = session_of(request)?;
                    // Most likely restarted without a stopped event
                    info!("Peer {} restarted; dropping its edges", peer_id);
                    self.model.reset_session(&peer_id, session)?;
                }
            }
            None => {
                let session = session_of(request)?;
                info!("New peer {} at {}", peer_id, addr);
                self.model
                    .insert(PeerRecord::new(certificate.clone(), addr, session, now));
            }
        }

        self.model.update_address(&peer_id, addr)?;
        if let Some(record) = self.model.get_mut(&peer_id) {
            record.last_seen = now;
            record.swarms.insert(
                info_hash,
                Progress {
                    uploaded: request.uploaded,
                    downloaded: request.downloaded,
                    left: request.left,
                },
            );
        }
        let dropped = self.model.report_failed(&peer_id, &request.failed);
        if dropped > 0 {
            debug!("Dropped {} failed edges of {}", dropped, peer_id);
        }

        if request.event == Some(Event::Stopped) {
            self.stop(&peer_id, &info_hash);
            return Ok(Answer {
                response: AnnounceResponse::default(),
                probe: None,
            });
        }

        self.swarms.update(info_hash, peer_id, request.left);
        if request.event == Some(Event::Completed) {
            self.swarms.record_completed(&info_hash);
        }

        let probe = self.schedule_probe(&peer_id)?;
        let made = {
            let model = &mut self.model;
            let allow_close = self.graph.allow_close_neighbors;
            self.ctx
                .with_rng(|rng| model.rand_connect(rng, &peer_id, allow_close))
        };
        if made > 0 {
            debug!("Connected {} to {} new neighbors", peer_id, made);
        }

        let response = self.response_for(&peer_id, &info_hash);
        Ok(Answer { response, probe })
    }

    fn response_for(&self, peer_id: &PeerId, info_hash: &InfoHash) -> AnnounceResponse {
        let Some(record) = self.model.get(peer_id) else {
            return AnnounceResponse::default();
        };
        let mut peers: Vec<PeerEntry> = record
            .neighbors()
            .map(|(_, n)| PeerEntry {
                ip: n.addr.ip().to_string(),
                port: n.addr.port(),
                nid: n.nid.0,
            })
            .collect();
        peers.sort_by_key(|p| p.nid);
        peers.truncate(self.config.max_give);

        let tracking_codes = issue_tracking_codes(
            &self.ctx,
            &self.model,
            &self.swarms,
            peer_id,
            info_hash,
            self.config.response_size,
            &self.graph,
        )
        .into_iter()
        .map(|issued| (ByteBuf::from(issued.key.to_bytes()), ByteBuf::from(issued.code)))
        .collect::<Vec<_>>();

        let warning_message = (record.nat() == NatState::Unreachable).then(|| {
            "tracker could not connect to your listen port; no neighbors will be assigned"
                .to_string()
        });

        debug!(
            "Answering {} with {} neighbors and {} tracking codes",
            peer_id,
            peers.len(),
            tracking_codes.len()
        );
        AnnounceResponse {
            interval: Some(self.config.reannounce_interval),
            peers,
            tracking_codes,
            failure_reason: None,
            warning_message,
        }
    }

    /// The address neighbors should dial, honoring the `ip` override
    fn announced_ip(&self, request: &AnnounceRequest, remote: IpAddr) -> Result<IpAddr> {
        let Some(given) = &request.ip else {
            return Ok(remote);
        };
        let ip: IpAddr = given
            .parse()
            .map_err(|_| TrackerError::BadRequest(format!("invalid ip {:?}", given)))?;
        if ip == remote || !self.config.only_local_override_ip || is_local(remote) {
            return Ok(ip);
        }
        debug!("Ignoring ip override {} from non-local {}", ip, remote);
        Ok(remote)
    }

    fn schedule_probe(&mut self, peer_id: &PeerId) -> Result<Option<Probe>> {
        let Some(record) = self.model.get(peer_id) else {
            return Ok(None);
        };
        if record.nat() == NatState::Reachable
            || record.nat_probes() >= self.config.nat_check
            || self.probing.contains(peer_id)
        {
            return Ok(None);
        }
        let addr = record.addr;
        let attempt = self.model.record_probe(peer_id)?;
        self.probing.insert(*peer_id);
        debug!("Probing {} at {} (attempt {})", peer_id, addr, attempt);
        Ok(Some(Probe {
            peer_id: *peer_id,
            addr,
        }))
    }

    /// Record the outcome of a probe started by [`Tracker::announce`]
    pub fn nat_result(&mut self, probe: Probe, reachable: bool) {
        self.probing.remove(&probe.peer_id);
        let Some(record) = self.model.get(&probe.peer_id) else {
            return;
        };
        if record.addr != probe.addr {
            debug!("Discarding probe of {} at old address {}", probe.peer_id, probe.addr);
            return;
        }
        if let Err(e) = self.model.set_nat_verdict(&probe.peer_id, reachable) {
            warn!("NAT verdict for {}: {}", probe.peer_id, e);
            return;
        }
        if reachable {
            info!("Peer {} is reachable at {}", probe.peer_id, probe.addr);
        } else {
            info!("Peer {} is not reachable at {}", probe.peer_id, probe.addr);
        }
    }

    /// A peer left a swarm; once it is in none it leaves the graph
    fn stop(&mut self, peer_id: &PeerId, info_hash: &InfoHash) {
        self.swarms.remove_peer(info_hash, peer_id);
        let remaining = match self.model.get_mut(peer_id) {
            Some(record) => {
                record.swarms.remove(info_hash);
                record.swarms.len()
            }
            None => 0,
        };
        if remaining == 0 {
            info!("Peer {} stopped its last swarm", peer_id);
            self.forget(peer_id);
        }
    }

    fn forget(&mut self, peer_id: &PeerId) {
        self.model.remove(peer_id);
        self.swarms.remove_everywhere(peer_id);
        self.probing.remove(peer_id);
    }

    /// Drop peers that have not announced within the timeout
    pub fn expire(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.config.timeout_downloaders_interval);
        let stale = self.model.expire(cutoff);
        for peer in &stale {
            self.swarms.remove_everywhere(peer);
            self.probing.remove(peer);
        }
        if !stale.is_empty() {
            info!("Expired {} silent peers", stale.len());
        }
        stale.len()
    }

    /// Counts for one swarm, or for every swarm
    pub fn scrape(&self, info_hash: Option<&InfoHash>) -> ScrapeResponse {
        let entry = |swarm: &Swarm| ScrapeEntry {
            complete: swarm.seeders.len() as u64,
            incomplete: swarm.leechers.len() as u64,
            downloaded: swarm.completed,
        };
        let mut response = ScrapeResponse::default();
        match info_hash {
            Some(hash) => {
                if let Some(swarm) = self.swarms.get(hash) {
                    response.files.insert(ByteBuf::from(hash.to_vec()), entry(swarm));
                }
            }
            None => {
                for (hash, swarm) in self.swarms.iter() {
                    response.files.insert(ByteBuf::from(hash.to_vec()), entry(swarm));
                }
            }
        }
        response
    }

    pub fn stats(&self) -> TrackerStats {
        let mut swarms: Vec<SwarmStats> = self
            .swarms
            .iter()
            .map(|(hash, swarm)| SwarmStats {
                info_hash: hash_to_hex(hash),
                seeders: swarm.seeders.len(),
                leechers: swarm.leechers.len(),
                completed: swarm.completed,
            })
            .collect();
        swarms.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
        TrackerStats {
            peers: self.model.len(),
            reachable: self.model.reachable_len(),
            probing: self.probing.len(),
            swarms,
        }
    }

    /// Write peers and swarms to `path`, replacing it atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = SavedState {
            peers: self
                .model
                .peers()
                .map(|r| SavedPeer {
                    certificate: hex::encode(r.certificate.der()),
                    addr: r.addr,
                    session_id: r.session_id,
                    last_seen: r.last_seen,
                    nat: r.nat(),
                    nat_probes: r.nat_probes(),
                    swarms: r
                        .swarms
                        .iter()
                        .map(|(hash, progress)| (hash_to_hex(hash), *progress))
                        .collect(),
                })
                .collect(),
            swarms: self
                .swarms
                .iter()
                .map(|(hash, swarm)| (hash_to_hex(hash), swarm.clone()))
                .collect(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved {} peers to {}", state.peers.len(), path.display());
        Ok(())
    }

    /// Restore what [`Tracker::save`] wrote
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let state: SavedState = serde_json::from_slice(&std::fs::read(path)?)?;
        for saved in state.peers {
            let der = hex::decode(&saved.certificate)
                .map_err(|e| TrackerError::State(format!("certificate: {}", e)))?;
            let mut record = PeerRecord::new(
                PeerCertificate::from_der(&der)?,
                saved.addr,
                saved.session_id,
                saved.last_seen,
            )
            .with_nat(saved.nat, saved.nat_probes);
            for (hash, progress) in saved.swarms {
                record.swarms.insert(parse_hash(&hash)?, progress);
            }
            self.model.insert(record);
        }
        for (hash, mut swarm) in state.swarms {
            swarm.seeders.retain(|p| self.model.contains(p));
            swarm.leechers.retain(|p| self.model.contains(p));
            self.swarms.restore(parse_hash(&hash)?, swarm);
        }
        info!(
            "Loaded {} peers in {} swarms from {}",
            self.model.len(),
            self.swarms.len(),
            path.display()
        );
        Ok(())
    }
}

fn session_of(request: &AnnounceRequest) -> Result<SessionId> {
    request
        .session_id
        .ok_or_else(|| TrackerError::BadRequest("sessionid is required to register".to_string()))
}

fn parse_hash(hex: &str) -> Result<InfoHash> {
    hex_to_hash(hex).map_err(|e| TrackerError::State(format!("infohash {}: {}", hex, e)))
}

/// Loopback, private or link-local
pub fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
