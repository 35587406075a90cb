//! Ordered-consumer sequence tracking.
//!
//! Delivery metadata rides in the reply subject of every consumer message:
//! `<prefix>.ACK.<stream>.<consumer>.<delivered>.<stream seq>.<delivery
//! seq>.<timestamp>.<pending>`. The cursor checks each delivery sequence
//! against the last accepted one; any discontinuity marks a gap and the
//! consumer is recreated from the stream sequence after the last good
//! message.

use crate::error::ConsumerError;

/// Delivery metadata parsed from a consumer message's reply subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckInfo {
    /// Stream the message came from.
    pub stream: String,
    /// Consumer that delivered it.
    pub consumer: String,
    /// Delivery attempt count for this message.
    pub delivered: u64,
    /// Position of the message in the stream.
    pub stream_seq: u64,
    /// Position of the message in this consumer's delivery sequence.
    pub delivery_seq: u64,
    /// Server timestamp in nanoseconds.
    pub timestamp: u64,
    /// Messages still pending for the consumer after this one.
    pub pending: u64,
}

impl AckInfo {
    /// Parse a reply subject of at least nine dot-separated tokens.
    ///
    /// Tokens are taken from the end so that longer prefixes remain
    /// acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::BadAckMetadata`] when the subject has too
    /// few tokens or a numeric field fails to parse.
    pub fn parse(subject: &str) -> Result<Self, ConsumerError> {
        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.len() < 9 {
            return Err(ConsumerError::BadAckMetadata(subject.to_owned()));
        }
        let tail = &tokens[tokens.len() - 7..];
        let number = |token: &str| -> Result<u64, ConsumerError> {
            token
                .parse()
                .map_err(|_| ConsumerError::BadAckMetadata(subject.to_owned()))
        };
        Ok(Self {
            stream: (*tail[0]).to_owned(),
            consumer: (*tail[1]).to_owned(),
            delivered: number(tail[2])?,
            stream_seq: number(tail[3])?,
            delivery_seq: number(tail[4])?,
            timestamp: number(tail[5])?,
            pending: number(tail[6])?,
        })
    }
}

/// Outcome of checking one delivery against the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CursorOutcome {
    /// The delivery is the expected next one; the cursor advanced.
    Accept,
    /// Duplicate, gap, or server restart; the consumer must be recreated.
    Gap,
}

/// Last-accepted position of an ordered consumer.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OrderedCursor {
    stream_seq: u64,
    delivery_seq: u64,
}

impl OrderedCursor {
    /// Check a delivery and advance on the expected sequence.
    pub(crate) fn observe(&mut self, ack: &AckInfo) -> CursorOutcome {
        if ack.delivery_seq == self.delivery_seq + 1 {
            self.delivery_seq = ack.delivery_seq;
            self.stream_seq = ack.stream_seq;
            CursorOutcome::Accept
        } else {
            CursorOutcome::Gap
        }
    }

    /// Stream sequence a replacement consumer starts from.
    pub(crate) fn restart_seq(&self) -> u64 {
        self.stream_seq + 1
    }

    /// Restart the delivery count after a consumer recreation; the
    /// replacement numbers deliveries from one while the stream position is
    /// kept.
    pub(crate) fn rebase(&mut self) {
        self.delivery_seq = 0;
    }
}
