//! Per-neighbor link state
//!
//! A link goes through the neighbor handshake, then carries framed messages
//! for any number of streams. Stream ids are split by parity so both ends can
//! open streams without coordination: the side that dialed uses even ids,
//! the side that accepted uses odd ones.

use crate::endpoint::EndpointStream;
use crate::queue::{Reassembler, SendQueue};
use crate::relay::RelayHalf;
use anomos_core::handshake::HandshakeReader;
use anomos_core::wire::FrameReader;
use anomos_core::{Nid, PeerId, StreamId};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Handle of a link inside the overlay's arena
pub type LinkId = u32;

/// One stream on one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamRef {
    pub link: LinkId,
    pub stream: StreamId,
}

impl std::fmt::Display for StreamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.link, self.stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Dialer,
    Acceptor,
}

#[derive(Debug)]
pub(crate) enum Phase {
    Handshaking(HandshakeReader),
    Open,
    /// Final bytes are queued; nothing more is read or sent
    Draining,
}

#[derive(Debug)]
pub enum Stream {
    Relay(RelayHalf),
    Endpoint(EndpointStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Relay,
    Endpoint,
}

impl Stream {
    pub fn kind(&self) -> StreamKind {
        match self {
            Stream::Relay(_) => StreamKind::Relay,
            Stream::Endpoint(_) => StreamKind::Endpoint,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Stream::Relay(half) => half.state.name(),
            Stream::Endpoint(ep) => ep.state.name(),
        }
    }
}

#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub role: LinkRole,
    /// Fingerprint of the certificate presented during TLS
    pub peer_id: PeerId,
    /// Expected NID while dialing, agreed NID once open
    pub nid: Option<Nid>,
    pub(crate) phase: Phase,
    pub(crate) reader: FrameReader,
    pub(crate) reassembler: Reassembler,
    pub(crate) queue: SendQueue,
    /// Handshake bytes, sent ahead of any frame
    pub(crate) raw_out: Vec<u8>,
    pub(crate) streams: HashMap<StreamId, Stream>,
    /// Links whose outbound queues are too full for us to keep reading
    pub(crate) blocked_on: HashSet<LinkId>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub created: Instant,
    pub last_active: Instant,
}

impl Link {
    pub(crate) fn new(
        id: LinkId,
        role: LinkRole,
        peer_id: PeerId,
        expected: Option<Nid>,
        max_message_length: usize,
        send_quantum: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            role,
            peer_id,
            nid: expected,
            phase: Phase::Handshaking(HandshakeReader::new(expected)),
            reader: FrameReader::new(max_message_length),
            reassembler: Reassembler::new(max_message_length),
            queue: SendQueue::new(send_quantum),
            raw_out: Vec::new(),
            streams: HashMap::new(),
            blocked_on: HashSet::new(),
            bytes_sent: 0,
            bytes_received: 0,
            created: now,
            last_active: now,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open)
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.phase, Phase::Handshaking(_))
    }

    pub fn is_paused(&self) -> bool {
        !self.blocked_on.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether `id` has the parity this end allocates
    pub fn is_local_id(&self, id: StreamId) -> bool {
        let even = id % 2 == 0;
        match self.role {
            LinkRole::Dialer => even,
            LinkRole::Acceptor => !even,
        }
    }

    /// Lowest free id of our parity
    pub fn allocate_stream_id(&self) -> Option<StreamId> {
        let first: StreamId = match self.role {
            LinkRole::Dialer => 0,
            LinkRole::Acceptor => 1,
        };
        (first..=StreamId::MAX)
            .step_by(2)
            .find(|id| !self.streams.contains_key(id))
    }

    pub(crate) fn has_output(&self) -> bool {
        !self.raw_out.is_empty() || (self.is_open() && !self.queue.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayHalf;

    fn link(role: LinkRole) -> Link {
        Link::new(1, role, PeerId([1; 20]), None, 1024, 256, Instant::now())
    }

    #[test]
    fn test_parity_by_role() {
        let mut dialer = link(LinkRole::Dialer);
        let acceptor = link(LinkRole::Acceptor);
        assert_eq!(dialer.allocate_stream_id(), Some(0));
        assert_eq!(acceptor.allocate_stream_id(), Some(1));
        assert!(dialer.is_local_id(4));
        assert!(!dialer.is_local_id(5));
        assert!(acceptor.is_local_id(5));

        let now = Instant::now();
        dialer.streams.insert(0, Stream::Relay(RelayHalf::inbound(now)));
        dialer.streams.insert(1, Stream::Relay(RelayHalf::inbound(now)));
        assert_eq!(dialer.allocate_stream_id(), Some(2));

        // Released ids come back
        dialer.streams.remove(&0);
        assert_eq!(dialer.allocate_stream_id(), Some(0));
    }

    #[test]
    fn test_ids_never_collide() {
        let dialer = link(LinkRole::Dialer);
        let acceptor = link(LinkRole::Acceptor);
        for id in 0..=200u16 {
            assert_ne!(dialer.is_local_id(id), acceptor.is_local_id(id));
        }
    }

    #[test]
    fn test_new_link_is_handshaking() {
        let l = link(LinkRole::Acceptor);
        assert!(l.is_handshaking());
        assert!(!l.is_open());
        assert!(!l.has_output());
        assert!(!l.is_paused());
    }
}
