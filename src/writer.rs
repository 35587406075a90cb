//! Outbound write buffering.
//!
//! Publish bursts are coalesced into as few transport writes as possible:
//! fragments accumulate without copying until either the pending byte count
//! crosses the configured threshold (the connection loop then flushes
//! immediately) or the loop performs its end-of-turn flush. Abandoning a
//! connection resets the buffer without affecting bytes already handed to
//! the transport.

use bytes::Bytes;

/// Accumulates outbound byte fragments between flushes.
#[derive(Debug)]
pub(crate) struct OutboundBuffer {
    chunks: Vec<Bytes>,
    pending: usize,
    threshold: usize,
}

impl OutboundBuffer {
    /// Create a buffer that requests a flush once `threshold` bytes queue up.
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            chunks: Vec::new(),
            pending: 0,
            threshold,
        }
    }

    /// Queue one fragment. The bytes are not copied.
    pub(crate) fn enqueue(&mut self, fragment: Bytes) {
        self.pending += fragment.len();
        self.chunks.push(fragment);
    }

    /// Queue several fragments belonging to one logical write.
    pub(crate) fn enqueue_all(&mut self, fragments: impl IntoIterator<Item = Bytes>) {
        for fragment in fragments {
            self.enqueue(fragment);
        }
    }

    /// Bytes currently queued.
    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    /// Whether the pending byte count has crossed the flush threshold.
    pub(crate) fn should_flush(&self) -> bool {
        self.pending >= self.threshold
    }

    /// Whether anything is queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Take every queued fragment, leaving the buffer empty.
    pub(crate) fn take(&mut self) -> Vec<Bytes> {
        self.pending = 0;
        std::mem::take(&mut self.chunks)
    }

    /// Discard all queued bytes, typically when a connection is abandoned.
    pub(crate) fn reset(&mut self) {
        self.chunks.clear();
        self.pending = 0;
    }
}
