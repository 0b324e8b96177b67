//! Ordered queue of envelopes awaiting flush.

use crate::envelope::{OutboundEnvelope, RequestId};

/// Not-yet-sent envelopes in enqueue order. The queue survives while the
/// link is connecting and is drained whole on each flush so that bursts
/// coalesce into a single frame.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<OutboundEnvelope>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: OutboundEnvelope) {
        self.queue.push(envelope);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Removes every queued envelope carrying `id`, returning how many were
    /// dropped. Used on cancel so a never-sent request leaves no trace on
    /// the wire.
    pub fn withdraw(&mut self, id: &RequestId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|e| e.id() != id);
        before - self.queue.len()
    }

    pub fn drain(&mut self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut self.queue)
    }

    /// Puts a failed batch back at the head, ahead of anything enqueued
    /// since the drain.
    pub fn requeue_front(&mut self, batch: Vec<OutboundEnvelope>) {
        let tail = std::mem::replace(&mut self.queue, batch);
        self.queue.extend(tail);
    }
}
