//! Keeps the set of neighbor links in line with the tracker's view
//!
//! Each announce response lists the neighbors the tracker assigned to us.
//! [`NeighborManager::plan`] turns that list into links to close and
//! addresses to dial; the driver carries the plan out.

use crate::config::NetworkConfig;
use crate::link::{LinkId, LinkRole};
use crate::overlay::Overlay;
use anomos_core::announce::PeerEntry;
use anomos_core::{hash_to_hex, InfoHash, Nid, StreamKey};
use serde_bytes::ByteBuf;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A neighbor to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub nid: Nid,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub close: Vec<LinkId>,
    pub dial: Vec<Dial>,
}

#[derive(Debug)]
pub struct NeighborManager {
    max_initiate: usize,
    one_connection_per_ip: bool,
    dial_retries: u32,
    /// Neighbor list of the previous response
    assigned: HashMap<Nid, Dial>,
    /// Dials in flight
    dialing: HashMap<Nid, Dial>,
    attempts: HashMap<Nid, u32>,
    link_ips: HashMap<LinkId, IpAddr>,
}

impl NeighborManager {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            max_initiate: config.max_initiate,
            one_connection_per_ip: config.one_connection_per_ip,
            dial_retries: config.dial_retries.max(1),
            assigned: HashMap::new(),
            dialing: HashMap::new(),
            attempts: HashMap::new(),
            link_ips: HashMap::new(),
        }
    }

    /// Decide what to close and whom to dial for a fresh neighbor list
    pub fn plan(&mut self, overlay: &Overlay, peers: &[PeerEntry]) -> Plan {
        let mut wanted = HashMap::new();
        for peer in peers {
            let nid = Nid(peer.nid);
            if nid.is_nat_check() || peer.port == 0 {
                warn!("Ignoring bad neighbor entry {:?}", peer);
                continue;
            }
            wanted.insert(
                nid,
                Dial {
                    nid,
                    host: peer.ip.clone(),
                    port: peer.port,
                },
            );
        }

        let mut plan = Plan::default();

        // Only drop neighbors the tracker took away; links opened by others
        // since the last response may not be listed yet
        for nid in self.assigned.keys() {
            if wanted.contains_key(nid) {
                continue;
            }
            if let Some(link) = overlay.link_for(*nid) {
                info!("Tracker dropped neighbor NID {}, closing link {}", nid, link);
                plan.close.push(link);
            }
        }

        let mut initiated = overlay
            .link_ids()
            .into_iter()
            .filter(|id| {
                overlay
                    .link(*id)
                    .is_some_and(|l| l.role == LinkRole::Dialer)
            })
            .count()
            + self.dialing.len();
        let mut busy_ips: HashSet<IpAddr> = self
            .link_ips
            .iter()
            .filter(|(id, _)| !plan.close.contains(*id))
            .map(|(_, ip)| *ip)
            .collect();
        busy_ips.extend(
            self.dialing
                .values()
                .filter_map(|d| d.host.parse::<IpAddr>().ok()),
        );

        let mut candidates: Vec<&Dial> = wanted.values().collect();
        candidates.sort_by_key(|d| d.nid);
        for dial in candidates {
            if overlay.link_for(dial.nid).is_some() || self.dialing.contains_key(&dial.nid) {
                continue;
            }
            if initiated >= self.max_initiate {
                debug!("max_initiate reached, not dialing NID {}", dial.nid);
                break;
            }
            if self.one_connection_per_ip {
                if let Ok(ip) = dial.host.parse::<IpAddr>() {
                    if !busy_ips.insert(ip) {
                        debug!("Already linked to {}, skipping NID {}", ip, dial.nid);
                        continue;
                    }
                }
            }
            initiated += 1;
            self.dialing.insert(dial.nid, dial.clone());
            plan.dial.push(dial.clone());
        }

        self.assigned = wanted;
        plan
    }

    /// A dial finished with a TLS session; record the remote address
    pub fn connected(&mut self, nid: Option<Nid>, link: LinkId, ip: IpAddr) {
        if let Some(nid) = nid {
            self.dialing.remove(&nid);
        }
        self.link_ips.insert(link, ip);
    }

    pub fn link_opened(&mut self, nid: Nid) {
        self.attempts.remove(&nid);
    }

    pub fn link_closed(&mut self, link: LinkId) {
        self.link_ips.remove(&link);
    }

    /// A dial failed. Returns the dial to retry, or `None` once the
    /// neighbor should be reported unreachable.
    pub fn dial_failed(&mut self, nid: Nid) -> Option<Dial> {
        let dial = self.dialing.remove(&nid)?;
        let attempts = self.attempts.entry(nid).or_insert(0);
        *attempts += 1;
        if *attempts < self.dial_retries && self.assigned.contains_key(&nid) {
            debug!("Retrying NID {} (attempt {})", nid, *attempts + 1);
            self.dialing.insert(nid, dial.clone());
            return Some(dial);
        }
        self.attempts.remove(&nid);
        None
    }
}

/// Open one circuit per `(key ‖ iv, onion)` pair from an announce response
pub fn start_circuits(
    overlay: &mut Overlay,
    info_hash: InfoHash,
    codes: &[(ByteBuf, ByteBuf)],
    now: Instant,
) -> usize {
    let mut started = 0;
    for (key, code) in codes {
        let key = match StreamKey::from_bytes(key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Bad stream key from tracker: {}", e);
                continue;
            }
        };
        match overlay.start_circuit(info_hash, code, key, now) {
            Ok(_) => started += 1,
            Err(e) => warn!(
                "Could not start circuit for {}: {}",
                hash_to_hex(&info_hash),
                e
            ),
        }
    }
    started
}
