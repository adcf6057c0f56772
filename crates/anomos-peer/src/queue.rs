//! Fair outbound queue and PARTIAL reassembly for one neighbor link
//!
//! Streams enqueue whole message bodies. Each call to [`SendQueue::pop`]
//! walks the streams round-robin, giving each at most one quantum, and
//! splits anything that does not fit into PARTIAL fragments. A fragment
//! declares how many bytes of the original message remain, itself included.

use anomos_core::wire::{self, Message, FRAME_HEADER_LEN, PARTIAL_HEADER_LEN};
use anomos_core::{Error, Result, StreamId};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct Outgoing {
    body: Bytes,
    sent: usize,
}

#[derive(Debug)]
pub struct SendQueue {
    order: VecDeque<StreamId>,
    pending: HashMap<StreamId, VecDeque<Outgoing>>,
    quantum: usize,
    queued: usize,
}

impl SendQueue {
    pub fn new(quantum: usize) -> Self {
        Self {
            order: VecDeque::new(),
            pending: HashMap::new(),
            // A fragment must carry at least one byte
            quantum: quantum.max(PARTIAL_HEADER_LEN + 1),
            queued: 0,
        }
    }

    pub fn push(&mut self, stream_id: StreamId, body: Bytes) {
        self.queued += body.len();
        let queue = self.pending.entry(stream_id).or_default();
        if queue.is_empty() {
            self.order.push_back(stream_id);
        }
        queue.push_back(Outgoing { body, sent: 0 });
    }

    /// Body bytes waiting to go out
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drop everything queued for one stream that has not started sending
    pub fn discard_unsent(&mut self, stream_id: StreamId) {
        let Some(queue) = self.pending.get_mut(&stream_id) else {
            return;
        };
        let before: usize = queue.iter().map(|o| o.body.len() - o.sent).sum();
        queue.retain(|o| o.sent > 0);
        let after: usize = queue.iter().map(|o| o.body.len() - o.sent).sum();
        self.queued -= before - after;
        if queue.is_empty() {
            self.pending.remove(&stream_id);
            self.order.retain(|s| *s != stream_id);
        }
    }

    /// Produce up to roughly `budget` bytes of framed output
    pub fn pop(&mut self, budget: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < budget {
            let Some(stream_id) = self.order.pop_front() else {
                break;
            };
            let Some(queue) = self.pending.get_mut(&stream_id) else {
                continue;
            };
            let allowance = self.quantum.min(budget - out.len()).max(PARTIAL_HEADER_LEN + 1);
            let Some(head) = queue.front_mut() else {
                self.pending.remove(&stream_id);
                continue;
            };

            let remaining = head.body.len() - head.sent;
            if head.sent == 0 && head.body.len() <= allowance {
                out.extend_from_slice(&wire::encode_frame(stream_id, &head.body));
                self.queued -= remaining;
                queue.pop_front();
            } else {
                let take = remaining.min(allowance - PARTIAL_HEADER_LEN);
                let fragment = &head.body[head.sent..head.sent + take];
                let body = wire::partial_body(remaining as u32, fragment);
                out.extend_from_slice(&wire::encode_frame(stream_id, &body));
                head.sent += take;
                self.queued -= take;
                if head.sent == head.body.len() {
                    queue.pop_front();
                }
            }

            if queue.is_empty() {
                self.pending.remove(&stream_id);
            } else {
                self.order.push_back(stream_id);
            }
        }
        out
    }
}

#[derive(Debug)]
struct Partial {
    buf: BytesMut,
    expect_remaining: usize,
}

/// Reassembles PARTIAL fragments per stream
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<StreamId, Partial>,
    max_len: usize,
}

impl Reassembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_len,
        }
    }

    /// Feed one PARTIAL fragment; returns the whole message once complete
    pub fn feed(&mut self, stream_id: StreamId, remaining: u32, fragment: Bytes) -> Result<Option<Bytes>> {
        let remaining = remaining as usize;
        if fragment.is_empty() || fragment.len() > remaining {
            return Err(Error::Protocol(format!(
                "PARTIAL fragment of {} bytes with {} remaining",
                fragment.len(),
                remaining
            )));
        }
        let partial = match self.partials.remove(&stream_id) {
            Some(p) => {
                if p.expect_remaining != remaining {
                    return Err(Error::Protocol(format!(
                        "PARTIAL declared {} remaining, expected {}",
                        remaining, p.expect_remaining
                    )));
                }
                p
            }
            None => {
                if remaining > self.max_len {
                    return Err(Error::Oversize {
                        len: remaining,
                        max: self.max_len,
                    });
                }
                Partial {
                    buf: BytesMut::with_capacity(remaining),
                    expect_remaining: remaining,
                }
            }
        };
        let mut partial = partial;
        partial.buf.extend_from_slice(&fragment);
        partial.expect_remaining -= fragment.len();
        if partial.expect_remaining == 0 {
            let whole = partial.buf.freeze();
            if matches!(Message::parse(&whole)?, Message::Partial { .. }) {
                return Err(Error::Protocol("nested PARTIAL".to_string()));
            }
            return Ok(Some(whole));
        }
        self.partials.insert(stream_id, partial);
        Ok(None)
    }

    pub fn forget(&mut self, stream_id: StreamId) {
        self.partials.remove(&stream_id);
    }
}

/// Wire size of a frame carrying `body_len` body bytes
pub fn framed_len(body_len: usize) -> usize {
    FRAME_HEADER_LEN + body_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use anomos_core::wire::{body, FrameReader, MessageType, DEFAULT_MAX_MESSAGE_LENGTH};

    /// Push `out` through a frame reader and reassembler, returning whole
    /// messages per stream in arrival order
    fn receive(out: &[u8], reasm: &mut Reassembler) -> Vec<(StreamId, Bytes)> {
        let mut reader = FrameReader::new(DEFAULT_MAX_MESSAGE_LENGTH);
        let mut got = Vec::new();
        for frame in reader.feed(out).unwrap() {
            match Message::parse(&frame.body).unwrap() {
                Message::Partial { remaining, fragment } => {
                    if let Some(whole) = reasm.feed(frame.stream_id, remaining, fragment).unwrap() {
                        got.push((frame.stream_id, whole));
                    }
                }
                _ => got.push((frame.stream_id, frame.body)),
            }
        }
        got
    }

    #[test]
    fn test_small_message_goes_whole() {
        let mut q = SendQueue::new(16 * 1024);
        q.push(2, Bytes::from(body(MessageType::Confirm, &[])));
        assert_eq!(q.queued_bytes(), 1);
        let out = q.pop(1 << 20);
        assert_eq!(out, wire::encode_frame(2, &[MessageType::Confirm as u8]));
        assert!(q.is_empty());
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn test_fragmented_reassembles_identically() {
        let big: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let msg = Bytes::from(body(MessageType::Relay, &big));
        let mut q = SendQueue::new(16 * 1024);
        q.push(1, msg.clone());

        let mut reasm = Reassembler::new(DEFAULT_MAX_MESSAGE_LENGTH);
        let mut got = Vec::new();
        // Small budgets force many fragments
        while !q.is_empty() {
            let out = q.pop(5000);
            got.extend(receive(&out, &mut reasm));
        }
        assert_eq!(got, vec![(1, msg)]);
    }

    #[test]
    fn test_round_robin_does_not_starve() {
        let mut q = SendQueue::new(1024);
        let bulk = Bytes::from(body(MessageType::Relay, &[7u8; 100_000]));
        q.push(0, bulk.clone());
        let small = Bytes::from(body(MessageType::Confirm, &[]));
        q.push(2, small.clone());

        // One pass with room for two quanta reaches stream 2
        let out = q.pop(2048);
        let mut reasm = Reassembler::new(DEFAULT_MAX_MESSAGE_LENGTH);
        let got = receive(&out, &mut reasm);
        assert_eq!(got, vec![(2, small)]);

        let mut rest = Vec::new();
        while !q.is_empty() {
            rest.extend(receive(&q.pop(4096), &mut reasm));
        }
        assert_eq!(rest, vec![(0, bulk)]);
    }

    #[test]
    fn test_order_within_stream() {
        let mut q = SendQueue::new(64);
        let a = Bytes::from(body(MessageType::Relay, &[1u8; 200]));
        let b = Bytes::from(body(MessageType::Relay, &[2u8; 10]));
        q.push(4, a.clone());
        q.push(4, b.clone());
        let mut reasm = Reassembler::new(DEFAULT_MAX_MESSAGE_LENGTH);
        let mut got = Vec::new();
        while !q.is_empty() {
            got.extend(receive(&q.pop(100), &mut reasm));
        }
        assert_eq!(got, vec![(4, a), (4, b)]);
    }

    #[test]
    fn test_discard_unsent() {
        let mut q = SendQueue::new(64);
        q.push(4, Bytes::from(body(MessageType::Relay, &[1u8; 200])));
        q.push(4, Bytes::from(body(MessageType::Relay, &[2u8; 10])));
        q.pop(30);
        q.discard_unsent(4);
        // The half-sent message still completes
        assert!(!q.is_empty());
        while !q.is_empty() {
            q.pop(100);
        }
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn test_reassembly_rejects_bad_sequences() {
        let mut reasm = Reassembler::new(100);
        assert!(matches!(
            reasm.feed(1, 101, Bytes::from_static(b"x")),
            Err(Error::Oversize { .. })
        ));
        assert!(reasm.feed(1, 10, Bytes::from_static(b"abc")).unwrap().is_none());
        // Next fragment must declare 7 remaining
        assert!(reasm.feed(1, 9, Bytes::from_static(b"d")).is_err());
        assert!(reasm.feed(2, 2, Bytes::from_static(b"abc")).is_err());
    }

    #[test]
    fn test_framed_len() {
        assert_eq!(framed_len(1), 7);
    }
}
