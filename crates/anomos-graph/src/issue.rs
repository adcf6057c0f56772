//! Tracking-code issuance along generated paths

use crate::model::NetworkModel;
use crate::paths::generate_paths;
use crate::swarm::SwarmRegistry;
use crate::{GraphConfig, GraphError, Result};
use anomos_core::tcode::{self, RelayHop, TerminalHop};
use anomos_core::{CryptoContext, InfoHash, PeerId, StreamKey};
use std::collections::HashSet;
use tracing::{debug, warn};

/// A tracking code and the end-to-end key it carries to the destination
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub key: StreamKey,
    pub code: Vec<u8>,
    pub path: Vec<PeerId>,
}

/// Encode `path` as a tracking code.
///
/// The source holds the outermost layer; every hop is told the NID its own
/// neighbor table assigns to the next hop.
pub fn build_tracking_code(
    ctx: &CryptoContext,
    model: &NetworkModel,
    path: &[PeerId],
    info_hash: InfoHash,
    code_len: usize,
) -> Result<IssuedCode> {
    if path.len() < anomos_core::MIN_PATH_LEN {
        return Err(GraphError::InvalidPath(format!(
            "{} peers is shorter than the minimum",
            path.len()
        )));
    }
    let unique: HashSet<&PeerId> = path.iter().collect();
    if unique.len() != path.len() {
        return Err(GraphError::InvalidPath("peer repeated".to_string()));
    }

    let mut relays = Vec::with_capacity(path.len() - 1);
    for pair in path.windows(2) {
        let (hop, next) = (&pair[0], &pair[1]);
        let record = model.get(hop).ok_or(GraphError::UnknownPeer(*hop))?;
        let nid = record.nid_for(next).ok_or_else(|| {
            GraphError::InvalidPath(format!("{} and {} are not neighbors", hop, next))
        })?;
        relays.push(RelayHop {
            public_key: record.certificate.public_key().clone(),
            session_id: record.session_id,
            next: nid,
        });
    }

    let dest_id = path[path.len() - 1];
    let dest = model.get(&dest_id).ok_or(GraphError::UnknownPeer(dest_id))?;
    let key = StreamKey::generate(ctx);
    let terminal = TerminalHop {
        public_key: dest.certificate.public_key().clone(),
        session_id: dest.session_id,
        infohash: info_hash,
        key: key.clone(),
    };
    let code = tcode::build(ctx, &relays, &terminal, code_len)?;
    Ok(IssuedCode {
        key,
        code,
        path: path.to_vec(),
    })
}

/// Generate up to `count` paths from `source` into the swarm and encode each
pub fn issue_tracking_codes(
    ctx: &CryptoContext,
    model: &NetworkModel,
    swarms: &SwarmRegistry,
    source: &PeerId,
    info_hash: &InfoHash,
    count: usize,
    config: &GraphConfig,
) -> Vec<IssuedCode> {
    if count == 0 {
        return Vec::new();
    }
    let destinations = swarms.destinations(info_hash, source);
    let paths = ctx.with_rng(|rng| {
        generate_paths(
            model,
            rng,
            source,
            &destinations,
            count,
            config.min_path_len,
            config.max_path_len,
        )
    });
    debug!(
        "{} paths from {} over {} destinations",
        paths.len(),
        source,
        destinations.len()
    );
    paths
        .iter()
        .filter_map(
            |path| match build_tracking_code(ctx, model, path, *info_hash, config.tcode_len) {
                Ok(issued) => Some(issued),
                Err(e) => {
                    warn!("Failed to build tracking code for {}: {}", source, e);
                    None
                }
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeerRecord;
    use anomos_core::tcode::{peel, Peeled, DEFAULT_TCODE_LEN};
    use anomos_core::testing::{test_identity, test_key};
    use anomos_core::{Identity, SessionId};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Net {
        model: NetworkModel,
        ids: Vec<Identity>,
        sessions: Vec<SessionId>,
    }

    /// Peers 0..n on a line, each with its own key
    fn line(ctx: &CryptoContext, n: usize) -> Net {
        let mut rng = StdRng::seed_from_u64(7);
        let mut model = NetworkModel::new();
        let ids: Vec<Identity> = (0..n).map(test_identity).collect();
        let sessions: Vec<SessionId> = (0..n).map(|_| ctx.session_id()).collect();
        for (i, id) in ids.iter().enumerate() {
            let addr = format!("10.0.0.{}:5063", i + 1).parse().unwrap();
            model.insert(PeerRecord::new(id.certificate().clone(), addr, sessions[i], 0));
            model.set_nat_verdict(&id.peer_id(), true).unwrap();
        }
        for i in 1..n {
            model
                .connect(&mut rng, &ids[i - 1].peer_id(), &ids[i].peer_id())
                .unwrap();
        }
        Net {
            model,
            ids,
            sessions,
        }
    }

    #[test]
    fn test_code_peels_along_path() {
        let ctx = CryptoContext::new().unwrap();
        let net = line(&ctx, 4);
        let path: Vec<PeerId> = net.ids.iter().map(|i| i.peer_id()).collect();
        let issued =
            build_tracking_code(&ctx, &net.model, &path, [5; 20], DEFAULT_TCODE_LEN).unwrap();
        assert_eq!(issued.code.len(), DEFAULT_TCODE_LEN);

        let mut code = issued.code.clone();
        for i in 0..4 {
            match peel(&ctx, test_key(i), &net.sessions[i], &code).unwrap() {
                Peeled::Relay { nid, next } => {
                    let expected = net.model.get(&path[i]).unwrap().nid_for(&path[i + 1]);
                    assert_eq!(Some(nid), expected);
                    // The next hop calls us by the same NID
                    assert_eq!(
                        net.model.get(&path[i + 1]).unwrap().peer_for(nid),
                        Some(path[i])
                    );
                    code = next;
                }
                Peeled::Terminal { infohash, key } => {
                    assert_eq!(i, 3);
                    assert_eq!(infohash, [5; 20]);
                    assert_eq!(key, issued.key);
                }
            }
        }
    }

    #[test]
    fn test_outer_layer_only_opens_at_source() {
        let ctx = CryptoContext::new().unwrap();
        let net = line(&ctx, 3);
        let path: Vec<PeerId> = net.ids.iter().map(|i| i.peer_id()).collect();
        let issued = build_tracking_code(&ctx, &net.model, &path, [1; 20], 2048).unwrap();
        assert!(peel(&ctx, test_key(0), &net.sessions[0], &issued.code).is_ok());
        for i in 1..3 {
            assert!(peel(&ctx, test_key(i), &net.sessions[i], &issued.code).is_err());
        }
    }

    #[test]
    fn test_rejects_non_neighbor_hops() {
        let ctx = CryptoContext::new().unwrap();
        let net = line(&ctx, 3);
        let skip = vec![net.ids[0].peer_id(), net.ids[2].peer_id(), net.ids[1].peer_id()];
        assert!(matches!(
            build_tracking_code(&ctx, &net.model, &skip, [0; 20], 4096),
            Err(GraphError::InvalidPath(_))
        ));
        let short = vec![net.ids[0].peer_id(), net.ids[1].peer_id()];
        assert!(build_tracking_code(&ctx, &net.model, &short, [0; 20], 4096).is_err());
    }

    #[test]
    fn test_issue_for_swarm() {
        let ctx = CryptoContext::new().unwrap();
        let net = line(&ctx, 4);
        let ih = [8u8; 20];
        let mut swarms = SwarmRegistry::new();
        swarms.update(ih, net.ids[0].peer_id(), 0);
        swarms.update(ih, net.ids[3].peer_id(), 100);
        // A seeder next door is not a destination for another seeder
        swarms.update(ih, net.ids[1].peer_id(), 0);

        let issued = issue_tracking_codes(
            &ctx,
            &net.model,
            &swarms,
            &net.ids[0].peer_id(),
            &ih,
            10,
            &GraphConfig::default(),
        );
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].path.len(), 4);
        assert_eq!(issued[0].path[3], net.ids[3].peer_id());
    }
}
