//! Subscription registry and the public subscriber handle.
//!
//! The registry lives inside the connection task and is only ever touched
//! from the dispatch path. Each entry owns the sending half of a bounded
//! delivery channel; the [`Subscriber`] handle owns the receiving half.
//! Subscriptions survive reconnects: the full registry is replayed to the
//! new connection before traffic resumes.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    connection::Command,
    frame::{encode_subscribe, encode_unsubscribe},
    message::Message,
};

/// One registered subscription.
#[derive(Debug)]
pub(crate) struct SubEntry {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    /// Total deliveries after which the subscription auto-unsubscribes.
    pub(crate) max: Option<u64>,
    pub(crate) received: u64,
    pub(crate) tx: mpsc::Sender<Message>,
}

/// Result of dispatching one message frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Delivered to the subscription's channel.
    Delivered,
    /// Delivered (or dropped) and the entry reached its delivery cap.
    AutoUnsubscribed,
    /// The channel was full; the message was dropped.
    Dropped,
    /// No entry for this sid.
    Unknown,
}

/// Map of live subscriptions keyed by sid.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<u64, SubEntry>,
}

impl Registry {
    pub(crate) fn insert(&mut self, sid: u64, entry: SubEntry) {
        self.entries.insert(sid, entry);
    }

    pub(crate) fn remove(&mut self, sid: u64) -> Option<SubEntry> {
        self.entries.remove(&sid)
    }

    pub(crate) fn contains(&self, sid: u64) -> bool {
        self.entries.contains_key(&sid)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn sids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Deliver a message to the owning subscription.
    ///
    /// A full channel drops the message with a warning rather than blocking
    /// the dispatch path. Reaching the delivery cap retires the entry.
    pub(crate) fn dispatch(&mut self, sid: u64, message: Message) -> DispatchOutcome {
        let Some(entry) = self.entries.get_mut(&sid) else {
            return DispatchOutcome::Unknown;
        };
        entry.received += 1;
        let (outcome, retire) = match entry.tx.try_send(message) {
            Ok(()) => (DispatchOutcome::Delivered, false),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(sid, subject = %entry.subject, "slow consumer; message dropped");
                (DispatchOutcome::Dropped, false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(sid, "subscriber dropped; retiring entry");
                (DispatchOutcome::AutoUnsubscribed, true)
            }
        };
        let capped = entry.max.is_some_and(|max| entry.received >= max);
        if retire || capped {
            self.entries.remove(&sid);
        }
        if capped {
            return DispatchOutcome::AutoUnsubscribed;
        }
        outcome
    }

    /// Bound an entry's remaining deliveries, as `UNSUB <sid> <max>` does.
    ///
    /// Returns `true` when the cap is already met and the entry was retired.
    pub(crate) fn set_max(&mut self, sid: u64, max: u64) -> bool {
        match self.entries.get_mut(&sid) {
            Some(entry) if entry.received >= max => {
                self.entries.remove(&sid);
                true
            }
            Some(entry) => {
                entry.max = Some(max);
                false
            }
            None => false,
        }
    }

    /// Retire `old_sid` and re-register its entry under `new_sid` with a new
    /// subject, keeping the delivery channel (and hence the caller's
    /// receiving half) intact.
    pub(crate) fn rebind(&mut self, old_sid: u64, new_sid: u64, subject: String) -> bool {
        match self.entries.remove(&old_sid) {
            Some(mut entry) => {
                entry.subject = subject;
                self.entries.insert(new_sid, entry);
                true
            }
            None => false,
        }
    }

    /// Control lines re-establishing every live subscription, sent in one
    /// batch after a reconnect.
    pub(crate) fn replay(&self) -> Vec<Bytes> {
        let mut lines = Vec::with_capacity(self.entries.len());
        for (&sid, entry) in &self.entries {
            lines.push(encode_subscribe(
                &entry.subject,
                entry.queue_group.as_deref(),
                sid,
            ));
            if let Some(max) = entry.max {
                // The replacement connection counts deliveries from zero.
                let remaining = max.saturating_sub(entry.received);
                lines.push(encode_unsubscribe(sid, Some(remaining)));
            }
        }
        lines
    }

    /// Drop every entry. Receivers observe end-of-stream once their
    /// buffered messages are consumed.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Handle to one active subscription.
///
/// Messages are received in publish order for this subscription; ordering
/// across subscriptions is unspecified. Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscriber {
    sid: u64,
    subject: String,
    rx: mpsc::Receiver<Message>,
    commands: mpsc::Sender<Command>,
    next_sid: Arc<AtomicU64>,
    retired: bool,
}

impl Subscriber {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        rx: mpsc::Receiver<Message>,
        commands: mpsc::Sender<Command>,
        next_sid: Arc<AtomicU64>,
    ) -> Self {
        Self {
            sid,
            subject,
            rx,
            commands,
            next_sid,
            retired: false,
        }
    }

    /// Sid currently bound to this subscription.
    #[must_use]
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Subject currently bound to this subscription.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the subscription is retired (unsubscribed,
    /// delivery cap reached, or client closed) and every buffered message
    /// has been delivered.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Receive a buffered message without waiting.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Stop the subscription after `max` total deliveries.
    pub async fn unsubscribe_after(&mut self, max: u64) {
        let _ = self
            .commands
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: Some(max),
            })
            .await;
    }

    /// Stop the subscription immediately. Buffered messages are discarded
    /// along with the handle.
    pub async fn unsubscribe(mut self) {
        self.retired = true;
        let _ = self
            .commands
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            })
            .await;
    }

    /// Stop new server-side deliveries but keep the handle alive so already
    /// buffered messages can still be consumed; [`next`](Self::next) returns
    /// `None` once they run out.
    pub async fn drain(&mut self) {
        self.retired = true;
        let _ = self
            .commands
            .send(Command::DrainSubscription { sid: self.sid })
            .await;
    }

    /// Move this subscription to a new subject.
    ///
    /// The old sid is retired and a fresh one allocated; delivery to this
    /// handle continues uninterrupted.
    pub async fn resubscribe(&mut self, subject: impl Into<String>) {
        let subject = subject.into();
        let new_sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .commands
            .send(Command::Resubscribe {
                old_sid: self.sid,
                new_sid,
                subject: subject.clone(),
            })
            .await;
        self.sid = new_sid;
        self.subject = subject;
    }
}

impl Stream for Subscriber {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.retired {
            let _ = self.commands.try_send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            });
        }
    }
}
