// src/candidates.rs
//
// Bounded per-peer ICE candidate buffer. Two rules matter: a remote
// candidate must never reach the connection before a remote description
// exists, and recency beats completeness — after a network change the
// oldest candidates are usually dead, so overflow evicts from the front.

use std::collections::VecDeque;

use tracing::debug;

use crate::peer::IceCandidateInit;

/// FIFO candidate queue with a hard capacity; oldest entry is dropped on
/// overflow.
#[derive(Debug)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidateInit>,
    cap: usize,
}

impl CandidateBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Append a candidate, evicting the oldest if the buffer is full.
    /// Returns the evicted candidate, if any.
    pub fn push(&mut self, candidate: IceCandidateInit) -> Option<IceCandidateInit> {
        let evicted = if self.queue.len() >= self.cap {
            let old = self.queue.pop_front();
            if let Some(ref c) = old {
                debug!("candidate buffer full ({}), evicting oldest: {}", self.cap, c.candidate);
            }
            old
        } else {
            None
        };
        self.queue.push_back(candidate);
        evicted
    }

    /// Remove and return every buffered candidate in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidateInit> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
