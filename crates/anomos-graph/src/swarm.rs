//! Swarm membership keyed by infohash

use anomos_core::{InfoHash, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Peers sharing one infohash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swarm {
    pub seeders: HashSet<PeerId>,
    pub leechers: HashSet<PeerId>,
    /// Number of `completed` events seen
    pub completed: u64,
}

impl Swarm {
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.seeders.contains(peer) || self.leechers.contains(peer)
    }

    pub fn is_seed(&self, peer: &PeerId) -> bool {
        self.seeders.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.seeders.len() + self.leechers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeders.is_empty() && self.leechers.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerId> {
        self.seeders.iter().chain(self.leechers.iter())
    }
}

/// All swarms the tracker knows about
#[derive(Debug, Default)]
pub struct SwarmRegistry {
    swarms: HashMap<InfoHash, Swarm>,
}

impl SwarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `peer` among the seeders or leechers depending on `left`
    pub fn update(&mut self, info_hash: InfoHash, peer: PeerId, left: u64) {
        let swarm = self.swarms.entry(info_hash).or_default();
        if left == 0 {
            swarm.leechers.remove(&peer);
            swarm.seeders.insert(peer);
        } else {
            swarm.seeders.remove(&peer);
            swarm.leechers.insert(peer);
        }
    }

    pub fn record_completed(&mut self, info_hash: &InfoHash) {
        if let Some(swarm) = self.swarms.get_mut(info_hash) {
            swarm.completed += 1;
        }
    }

    /// Remove `peer` from one swarm; empty swarms are dropped
    pub fn remove_peer(&mut self, info_hash: &InfoHash, peer: &PeerId) -> bool {
        let Some(swarm) = self.swarms.get_mut(info_hash) else {
            return false;
        };
        let removed = swarm.seeders.remove(peer) | swarm.leechers.remove(peer);
        if swarm.is_empty() {
            self.swarms.remove(info_hash);
        }
        removed
    }

    /// Remove `peer` from every swarm it is in
    pub fn remove_everywhere(&mut self, peer: &PeerId) {
        for swarm in self.swarms.values_mut() {
            swarm.seeders.remove(peer);
            swarm.leechers.remove(peer);
        }
        self.swarms.retain(|_, s| !s.is_empty());
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<&Swarm> {
        self.swarms.get(info_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InfoHash, &Swarm)> {
        self.swarms.iter()
    }

    pub fn len(&self) -> usize {
        self.swarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swarms.is_empty()
    }

    pub fn restore(&mut self, info_hash: InfoHash, swarm: Swarm) {
        if !swarm.is_empty() {
            self.swarms.insert(info_hash, swarm);
        }
    }

    /// Who `source` should be given paths to: leechers when it seeds,
    /// everyone else otherwise
    pub fn destinations(&self, info_hash: &InfoHash, source: &PeerId) -> Vec<PeerId> {
        let Some(swarm) = self.swarms.get(info_hash) else {
            return Vec::new();
        };
        if swarm.is_seed(source) {
            swarm.leechers.iter().copied().collect()
        } else {
            swarm.members().filter(|p| *p != source).copied().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(i: u8) -> PeerId {
        PeerId([i; 20])
    }

    #[test]
    fn test_update_moves_between_roles() {
        let mut reg = SwarmRegistry::new();
        let ih = [1u8; 20];
        reg.update(ih, peer(1), 100);
        assert!(reg.get(&ih).unwrap().leechers.contains(&peer(1)));
        reg.update(ih, peer(1), 0);
        let swarm = reg.get(&ih).unwrap();
        assert!(swarm.is_seed(&peer(1)));
        assert!(swarm.leechers.is_empty());
    }

    #[test]
    fn test_destinations() {
        let mut reg = SwarmRegistry::new();
        let ih = [2u8; 20];
        reg.update(ih, peer(1), 0);
        reg.update(ih, peer(2), 0);
        reg.update(ih, peer(3), 5);
        reg.update(ih, peer(4), 5);

        let mut from_seed = reg.destinations(&ih, &peer(1));
        from_seed.sort();
        assert_eq!(from_seed, vec![peer(3), peer(4)]);

        let mut from_leecher = reg.destinations(&ih, &peer(3));
        from_leecher.sort();
        assert_eq!(from_leecher, vec![peer(1), peer(2), peer(4)]);

        assert!(reg.destinations(&[9u8; 20], &peer(1)).is_empty());
    }

    #[test]
    fn test_remove_drops_empty_swarm() {
        let mut reg = SwarmRegistry::new();
        let ih = [3u8; 20];
        reg.update(ih, peer(1), 0);
        reg.update([4u8; 20], peer(1), 1);
        assert!(reg.remove_peer(&ih, &peer(1)));
        assert!(reg.get(&ih).is_none());
        assert!(!reg.remove_peer(&ih, &peer(1)));

        reg.remove_everywhere(&peer(1));
        assert!(reg.is_empty());
    }
}
