//! Anomos Graph - the tracker's model of the overlay
//!
//! This crate holds the peer registry and neighbor graph, the per-infohash
//! swarm registry, the randomized path generator, and the issuance of
//! tracking codes along generated paths.

pub mod issue;
pub mod model;
pub mod paths;
pub mod swarm;

pub use issue::{build_tracking_code, issue_tracking_codes, IssuedCode};
pub use model::{NatState, Neighbor, NetworkModel, PeerRecord, Progress};
pub use paths::{find_path, generate_paths};
pub use swarm::{Swarm, SwarmRegistry};

use anomos_core::PeerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("No NID free on both {0} and {1}")]
    NidExhausted(PeerId, PeerId),

    #[error("{0} and {1} are already neighbors")]
    AlreadyNeighbors(PeerId, PeerId),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Core(#[from] anomos_core::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Graph and path parameters
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Longest path issued, source and destination included
    pub max_path_len: usize,
    /// Shortest path issued
    pub min_path_len: usize,
    /// Length of every tracking code on the wire
    pub tcode_len: usize,
    /// Let peers behind the same IP become neighbors
    pub allow_close_neighbors: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_path_len: anomos_core::DEFAULT_MAX_PATH_LEN,
            min_path_len: anomos_core::MIN_PATH_LEN,
            tcode_len: anomos_core::tcode::DEFAULT_TCODE_LEN,
            allow_close_neighbors: false,
        }
    }
}
