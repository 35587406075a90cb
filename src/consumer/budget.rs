//! Pending-budget accounting for pull requests.
//!
//! Every pull request adds its requested message and byte counts to the
//! outstanding counters; every delivery decrements them. Partial
//! fulfilment is reported by the server through discard notices carrying
//! the unfulfilled remainder, which is subtracted exactly as reported,
//! never as the full request.

/// Outstanding-message/byte counters for one pull consumer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingBudget {
    max_messages: usize,
    /// Zero disables byte accounting.
    max_bytes: usize,
    messages_outstanding: usize,
    bytes_outstanding: usize,
    requests_outstanding: usize,
}

impl PendingBudget {
    pub(crate) fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            max_messages,
            max_bytes,
            messages_outstanding: 0,
            bytes_outstanding: 0,
            requests_outstanding: 0,
        }
    }

    pub(crate) fn messages_outstanding(&self) -> usize {
        self.messages_outstanding
    }

    pub(crate) fn requests_outstanding(&self) -> usize {
        self.requests_outstanding
    }

    /// Record an issued pull request.
    pub(crate) fn add_request(&mut self, batch: usize, max_bytes: usize) {
        self.messages_outstanding += batch;
        self.bytes_outstanding += max_bytes;
        self.requests_outstanding += 1;
    }

    /// Record one delivered message.
    pub(crate) fn on_message(&mut self, payload_len: usize) {
        self.messages_outstanding = self.messages_outstanding.saturating_sub(1);
        if self.max_bytes > 0 {
            self.bytes_outstanding = self.bytes_outstanding.saturating_sub(payload_len);
        }
    }

    /// Record a discard notice terminating one pull request.
    ///
    /// The two fields are reported independently; a notice may carry either,
    /// both, or neither.
    pub(crate) fn on_discard(&mut self, messages: Option<usize>, bytes: Option<usize>) {
        if let Some(messages) = messages {
            self.messages_outstanding = self.messages_outstanding.saturating_sub(messages);
        }
        if let Some(bytes) = bytes {
            self.bytes_outstanding = self.bytes_outstanding.saturating_sub(bytes);
        }
        self.requests_outstanding = self.requests_outstanding.saturating_sub(1);
    }

    /// Whether the refilling mode should issue a new pull: outstanding
    /// counters at or below 75% of their configured maxima.
    pub(crate) fn needs_refill(&self) -> bool {
        let messages_low = self.messages_outstanding * 4 <= self.max_messages * 3;
        let bytes_low = self.max_bytes == 0 || self.bytes_outstanding * 4 <= self.max_bytes * 3;
        messages_low && bytes_low
    }

    /// Batch and byte amounts that top the budget back up to its maxima.
    pub(crate) fn refill_amounts(&self) -> (usize, usize) {
        let batch = self.max_messages.saturating_sub(self.messages_outstanding);
        let bytes = if self.max_bytes == 0 {
            0
        } else {
            self.max_bytes.saturating_sub(self.bytes_outstanding)
        };
        (batch, bytes)
    }

    /// Clear all counters, as after a missed-heartbeat blip or consumer
    /// recreation.
    pub(crate) fn reset(&mut self) {
        self.messages_outstanding = 0;
        self.bytes_outstanding = 0;
        self.requests_outstanding = 0;
    }
}
