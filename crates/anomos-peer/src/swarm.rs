//! Swarms served by this peer

use anomos_core::announce::Event;
use anomos_core::InfoHash;
use std::collections::HashMap;

/// Transfer totals and piece count of one local swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSwarm {
    pub num_pieces: u32,
    pub left: u64,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Event to send with the next announce
    pub pending_event: Option<Event>,
}

impl LocalSwarm {
    pub fn is_seed(&self) -> bool {
        self.left == 0
    }
}

#[derive(Debug, Default)]
pub struct SwarmTable {
    swarms: HashMap<InfoHash, LocalSwarm>,
}

impl SwarmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start serving a swarm; the next announce carries `started`
    pub fn add(&mut self, info_hash: InfoHash, num_pieces: u32, left: u64) {
        self.swarms.insert(
            info_hash,
            LocalSwarm {
                num_pieces,
                left,
                uploaded: 0,
                downloaded: 0,
                pending_event: Some(Event::Started),
            },
        );
    }

    pub fn remove(&mut self, info_hash: &InfoHash) -> Option<LocalSwarm> {
        self.swarms.remove(info_hash)
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<&LocalSwarm> {
        self.swarms.get(info_hash)
    }

    pub fn num_pieces(&self, info_hash: &InfoHash) -> Option<u32> {
        self.swarms.get(info_hash).map(|s| s.num_pieces)
    }

    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.swarms.contains_key(info_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InfoHash, &LocalSwarm)> {
        self.swarms.iter()
    }

    pub fn len(&self) -> usize {
        self.swarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swarms.is_empty()
    }

    pub fn record_uploaded(&mut self, info_hash: &InfoHash, bytes: u64) {
        if let Some(swarm) = self.swarms.get_mut(info_hash) {
            swarm.uploaded += bytes;
        }
    }

    /// Count downloaded bytes; reaching zero left queues `completed`
    pub fn record_downloaded(&mut self, info_hash: &InfoHash, bytes: u64) {
        if let Some(swarm) = self.swarms.get_mut(info_hash) {
            swarm.downloaded += bytes;
            if swarm.left > 0 {
                swarm.left = swarm.left.saturating_sub(bytes);
                if swarm.left == 0 {
                    swarm.pending_event = Some(Event::Completed);
                }
            }
        }
    }

    /// Take the event due for the next announce of `info_hash`
    pub fn take_event(&mut self, info_hash: &InfoHash) -> Option<Event> {
        self.swarms
            .get_mut(info_hash)
            .and_then(|s| s.pending_event.take())
    }

    /// Put an event back after a failed announce
    pub fn restore_event(&mut self, info_hash: &InfoHash, event: Option<Event>) {
        if let Some(swarm) = self.swarms.get_mut(info_hash) {
            if swarm.pending_event.is_none() {
                swarm.pending_event = event;
            }
        }
    }
}
