//! Anomos Peer Library
//!
//! The peer side of the overlay: neighbor links and the streams multiplexed
//! over them, the relay and endpoint state machines, the tracker client, and
//! the tokio driver that ties them to real sockets.

pub mod announce;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod link;
pub mod neighbors;
pub mod overlay;
pub mod queue;
pub mod relay;
pub mod swarm;

pub use config::Config;
pub use driver::{run_peer_loop, AppEvent, Command, PeerHandle};
pub use link::{LinkId, LinkRole, StreamRef};
pub use overlay::{LinkStats, Overlay, OverlayConfig, OverlayEvent};
