//! Anomos Tracker Library
//!
//! The tracker authenticates peers by their TLS certificate, probes whether
//! they accept inbound links, wires reachable peers into a random neighbor
//! graph, and hands each announcing peer tracking codes for paths into its
//! swarm.

pub mod config;
pub mod natcheck;
pub mod server;
pub mod tracker;

pub use config::Config;
pub use server::{run_tracker, serve, Command, TrackerHandle};
pub use tracker::{Answer, Probe, Tracker, TrackerStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Malformed request; answered with HTTP 400
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Well-formed but refused; answered with a bencoded failure reason
    #[error("{0}")]
    Refused(String),

    #[error("Invalid saved state: {0}")]
    State(String),

    #[error(transparent)]
    Core(#[from] anomos_core::Error),

    #[error(transparent)]
    Graph(#[from] anomos_graph::GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
