//! Randomized path generation
//!
//! Paths are found by layering the graph outward from the destination's
//! neighbors until one layer touches a neighbor of the source, then walking
//! back toward the destination one layer at a time.

use crate::model::NetworkModel;
use anomos_core::PeerId;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use std::collections::HashSet;

/// Find one path `[source, .., dest]` with `min_len..=max_len` peers, or
/// `None` if the graph has no such path.
pub fn find_path<R: Rng>(
    model: &NetworkModel,
    rng: &mut R,
    source: &PeerId,
    dest: &PeerId,
    min_len: usize,
    max_len: usize,
) -> Option<Vec<PeerId>> {
    if source == dest || min_len < 3 || max_len < min_len {
        return None;
    }
    let src = model.get(source)?;
    let dst = model.get(dest)?;

    let mut seen: HashSet<PeerId> = [*source, *dest].into_iter().collect();
    // levels[i] holds the peers exactly i+1 hops from dest
    let mut levels: Vec<HashSet<PeerId>> = Vec::new();
    let first: HashSet<PeerId> = dst
        .neighbors()
        .map(|(p, _)| *p)
        .filter(|p| !seen.contains(p))
        .collect();
    seen.extend(first.iter().copied());
    levels.push(first);

    // A path whose first relay sits in levels[j] has j + 3 peers
    let mut hit = None;
    for j in 0..=(max_len - 3) {
        while levels.len() <= j {
            let Some(last) = levels.last() else {
                return None;
            };
            let next: HashSet<PeerId> = last
                .iter()
                .filter_map(|p| model.get(p))
                .flat_map(|r| r.neighbors().map(|(n, _)| *n))
                .filter(|n| !seen.contains(n))
                .collect();
            if next.is_empty() {
                return None;
            }
            seen.extend(next.iter().copied());
            levels.push(next);
        }
        if j + 3 < min_len {
            continue;
        }
        let candidates: Vec<PeerId> = src
            .neighbors()
            .map(|(p, _)| *p)
            .filter(|p| levels[j].contains(p))
            .collect();
        if let Some(start) = candidates.choose(rng) {
            hit = Some((j, *start));
            break;
        }
    }
    let (j, start) = hit?;

    let mut path = vec![*source, start];
    let mut tail = start;
    for level in levels[..j].iter().rev() {
        let record = model.get(&tail)?;
        let next = record
            .neighbors()
            .map(|(p, _)| *p)
            .filter(|p| level.contains(p) && !path.contains(p))
            .choose(rng)?;
        path.push(next);
        tail = next;
    }
    path.push(*dest);
    Some(path)
}

/// Up to `count` paths from `source`, at most one per destination
pub fn generate_paths<R: Rng>(
    model: &NetworkModel,
    rng: &mut R,
    source: &PeerId,
    destinations: &[PeerId],
    count: usize,
    min_len: usize,
    max_len: usize,
) -> Vec<Vec<PeerId>> {
    let mut order = destinations.to_vec();
    order.shuffle(rng);
    order
        .iter()
        .filter_map(|dest| find_path(model, rng, source, dest, min_len, max_len))
        .take(count)
        .collect()
}

/// Every hop is a neighbor of the next and no peer repeats
pub fn is_valid_path(model: &NetworkModel, path: &[PeerId]) -> bool {
    let unique: HashSet<&PeerId> = path.iter().collect();
    unique.len() == path.len()
        && path.windows(2).all(|w| {
            model
                .get(&w[0])
                .is_some_and(|r| r.is_neighbor(&w[1]))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{peer_id, reachable_model};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// 0 - 1 - 2 - ... - (n-1)
    fn line(n: u16, rng: &mut StdRng) -> NetworkModel {
        let mut model = reachable_model(n);
        for i in 1..n {
            model.connect(rng, &peer_id(i - 1), &peer_id(i)).unwrap();
        }
        model
    }

    #[test]
    fn test_line_path() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = line(5, &mut rng);
        let path = find_path(&model, &mut rng, &peer_id(0), &peer_id(4), 3, 6).unwrap();
        assert_eq!(path, (0..5).map(peer_id).collect::<Vec<_>>());
        assert!(is_valid_path(&model, &path));

        // Too long for the limit
        assert!(find_path(&model, &mut rng, &peer_id(0), &peer_id(4), 3, 4).is_none());
    }

    #[test]
    fn test_direct_neighbors_need_a_detour() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut model = reachable_model(3);
        model.connect(&mut rng, &peer_id(0), &peer_id(1)).unwrap();
        assert!(find_path(&model, &mut rng, &peer_id(0), &peer_id(1), 3, 6).is_none());

        model.connect(&mut rng, &peer_id(0), &peer_id(2)).unwrap();
        model.connect(&mut rng, &peer_id(2), &peer_id(1)).unwrap();
        let path = find_path(&model, &mut rng, &peer_id(0), &peer_id(1), 3, 6).unwrap();
        assert_eq!(path, vec![peer_id(0), peer_id(2), peer_id(1)]);
    }

    #[test]
    fn test_min_len_forces_longer_path() {
        let mut rng = StdRng::seed_from_u64(3);
        // Triangle 0-1-2 plus a tail 0-3-4-2
        let mut model = reachable_model(5);
        for (a, b) in [(0, 1), (1, 2), (0, 3), (3, 4), (4, 2)] {
            model.connect(&mut rng, &peer_id(a), &peer_id(b)).unwrap();
        }
        let path = find_path(&model, &mut rng, &peer_id(0), &peer_id(2), 4, 6).unwrap();
        assert_eq!(path, vec![peer_id(0), peer_id(3), peer_id(4), peer_id(2)]);
    }

    #[test]
    fn test_random_graph_paths_are_valid() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut model = reachable_model(60);
        for i in 0..60 {
            model.rand_connect(&mut rng, &peer_id(i), true);
        }
        let dests: Vec<PeerId> = (1..60).map(peer_id).collect();
        for _ in 0..20 {
            let paths = generate_paths(&model, &mut rng, &peer_id(0), &dests, 10, 3, 6);
            assert!(!paths.is_empty());
            let mut ends = HashSet::new();
            for path in &paths {
                assert!(path.len() >= 3 && path.len() <= 6);
                assert_eq!(path[0], peer_id(0));
                assert!(is_valid_path(&model, path));
                assert!(ends.insert(*path.last().unwrap()));
            }
        }
    }

    #[test]
    fn test_unknown_peers() {
        let mut rng = StdRng::seed_from_u64(5);
        let model = reachable_model(2);
        assert!(find_path(&model, &mut rng, &peer_id(0), &peer_id(9), 3, 6).is_none());
        assert!(find_path(&model, &mut rng, &peer_id(0), &peer_id(0), 3, 6).is_none());
    }
}
