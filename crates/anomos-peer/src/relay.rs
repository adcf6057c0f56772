//! One half of a relay pair
//!
//! A relay forwards opaque bodies between an inbound stream (facing the
//! previous hop) and an outbound stream (facing the next hop). Each half
//! lives on its own link and names its partner by `(link, stream id)`.

use crate::link::StreamRef;
use anomos_core::{Error, Result};
use bytes::Bytes;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// TCODE received; the outbound TCODE has not gone out yet
    HalfOpenIn,
    /// Outbound TCODE sent; waiting for CONFIRM from the next hop
    HalfOpenOut,
    Established,
    /// BREAK sent, waiting for ACKBREAK
    Closing,
    Closed,
}

impl RelayState {
    pub fn name(self) -> &'static str {
        match self {
            RelayState::HalfOpenIn => "half-open-in",
            RelayState::HalfOpenOut => "half-open-out",
            RelayState::Established => "established",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
        }
    }

    pub fn is_half_open(self) -> bool {
        matches!(self, RelayState::HalfOpenIn | RelayState::HalfOpenOut)
    }
}

#[derive(Debug)]
pub struct RelayHalf {
    pub state: RelayState,
    pub partner: Option<StreamRef>,
    /// True for the half facing the next hop
    pub outbound: bool,
    /// When the current state was entered
    pub since: Instant,
    pending: Vec<Bytes>,
    pending_bytes: usize,
}

impl RelayHalf {
    /// Half created by an incoming TCODE
    pub fn inbound(now: Instant) -> Self {
        Self {
            state: RelayState::HalfOpenIn,
            partner: None,
            outbound: false,
            since: now,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Half created to carry the peeled TCODE to the next hop
    pub fn outbound(partner: StreamRef, now: Instant) -> Self {
        Self {
            state: RelayState::HalfOpenOut,
            partner: Some(partner),
            outbound: true,
            since: now,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    pub fn set_state(&mut self, state: RelayState, now: Instant) {
        self.state = state;
        self.since = now;
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, RelayState::Closing | RelayState::Closed)
    }

    /// Hold a body that arrived before the pair was established
    pub fn hold(&mut self, body: Bytes, limit: usize) -> Result<()> {
        if self.pending_bytes + body.len() > limit {
            return Err(Error::Protocol(format!(
                "{} bytes buffered on a relay that is not established",
                self.pending_bytes + body.len()
            )));
        }
        self.pending_bytes += body.len();
        self.pending.push(body);
        Ok(())
    }

    pub fn take_held(&mut self) -> Vec<Bytes> {
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }

    pub fn discard_held(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }
}
