//! Request/response correlation over one shared inbox subscription.
//!
//! Every request publishes with a reply subject of the form
//! `<inbox prefix>.<mux id>.<token>`; one wildcard subscription covers the
//! whole prefix, and the token table routes each reply to its waiter. The
//! table is the one shared structure touched from outside the connection
//! task, so it lives behind its own exclusive-access boundary.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use dashmap::DashMap;
use futures::Stream;
use rand::{Rng, distributions::Alphanumeric};
use tokio::{
    sync::{mpsc, oneshot},
    time::Sleep,
};
use tracing::debug;

use crate::{headers::STATUS_NO_RESPONDERS, message::Message};

/// Length of generated inbox tokens.
const TOKEN_LEN: usize = 22;

/// Generate a random inbox token.
pub(crate) fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Last dot-separated segment of a reply subject, the mux token.
pub(crate) fn reply_token(subject: &str) -> &str {
    subject.rsplit('.').next().unwrap_or(subject)
}

/// Waiter for one pending request.
#[derive(Debug)]
enum Responder {
    /// Single-response request; resolved and removed by the first reply.
    Single(oneshot::Sender<Message>),
    /// Multi-response request; stays registered until the caller's
    /// termination strategy removes it.
    Stream(mpsc::Sender<Message>),
}

/// Token table correlating inbox replies to pending requests.
///
/// Closing the table drops every waiter's sending half; callers observe
/// their channel closing and map it to a connection-closed error.
#[derive(Debug, Default)]
pub(crate) struct RequestMux {
    entries: DashMap<String, Responder>,
    closed: AtomicBool,
}

impl RequestMux {
    /// Register a single-response request under `token`.
    pub(crate) fn register_single(&self, token: String) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(token, Responder::Single(tx));
        rx
    }

    /// Register a multi-response request under `token`.
    pub(crate) fn register_stream(
        &self,
        token: String,
        capacity: usize,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity);
        self.entries.insert(token, Responder::Stream(tx));
        rx
    }

    /// Route one inbox reply to its waiter. Returns `false` for unmatched
    /// tokens (late replies after timeout or cancellation).
    pub(crate) fn resolve(&self, token: &str, message: Message) -> bool {
        match self.entries.get(token) {
            None => false,
            Some(entry) => match &*entry {
                Responder::Single(_) => {
                    drop(entry);
                    match self.entries.remove(token) {
                        Some((_, Responder::Single(tx))) => tx.send(message).is_ok(),
                        // Raced with removal.
                        Some((token, responder)) => {
                            self.entries.insert(token, responder);
                            false
                        }
                        None => false,
                    }
                }
                Responder::Stream(tx) => {
                    if tx.try_send(message).is_err() {
                        debug!(token, "reply stream gone; dropping entry");
                        drop(entry);
                        self.entries.remove(token);
                        return false;
                    }
                    true
                }
            },
        }
    }

    /// Remove a pending entry, typically on timeout or cancellation.
    pub(crate) fn remove(&self, token: &str) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Number of pending entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject every pending request; the table accepts no new entries'
    /// replies after this.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
    }
}

/// Removes a single-response entry once its waiting future goes away,
/// whether it resolved, timed out, or was dropped mid-flight.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    mux: Arc<RequestMux>,
    token: String,
}

impl PendingEntry {
    pub(crate) fn new(mux: Arc<RequestMux>, token: String) -> Self {
        Self { mux, token }
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.mux.remove(&self.token);
    }
}

/// How a multi-response request decides it has seen every reply.
///
/// All strategies additionally stop when the connection closes. The
/// strategies compose: a count bound and an overall deadline always apply
/// when set, whichever fires first.
#[derive(Clone, Copy, Debug, Default)]
pub struct Termination {
    /// Fixed wall-clock window for the whole exchange.
    pub timer: Option<Duration>,
    /// Stop after this many responses.
    pub count: Option<usize>,
    /// Idle timer re-armed by every response; stop once replies go quiet.
    pub stall: Option<Duration>,
    /// Stop upon a zero-length payload marking end-of-stream.
    pub sentinel: bool,
}

/// Stream of replies to a multi-response request.
///
/// Ends according to the configured [`Termination`], on a no-responders
/// status reply, or when the client closes. Dropping the stream cancels
/// the pending entry.
#[derive(Debug)]
pub struct Replies {
    rx: mpsc::Receiver<Message>,
    mux: Arc<RequestMux>,
    token: String,
    deadline: Option<Pin<Box<Sleep>>>,
    stall: Option<Duration>,
    stall_timer: Option<Pin<Box<Sleep>>>,
    remaining: Option<usize>,
    sentinel: bool,
    finished: bool,
}

impl Replies {
    pub(crate) fn new(
        rx: mpsc::Receiver<Message>,
        mux: Arc<RequestMux>,
        token: String,
        termination: Termination,
    ) -> Self {
        let mut replies = Self {
            rx,
            mux,
            token,
            deadline: termination
                .timer
                .map(|timer| Box::pin(tokio::time::sleep(timer))),
            stall: termination.stall,
            // Armed up front so a request with zero replies still stalls out.
            stall_timer: termination
                .stall
                .map(|stall| Box::pin(tokio::time::sleep(stall))),
            remaining: termination.count,
            sentinel: termination.sentinel,
            finished: false,
        };
        if termination.count == Some(0) {
            replies.finish();
        }
        replies
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.mux.remove(&self.token);
        }
    }
}

impl Stream for Replies {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                if message.status() == Some(STATUS_NO_RESPONDERS) {
                    this.finish();
                    return Poll::Ready(None);
                }
                if this.sentinel && message.payload.is_empty() {
                    this.finish();
                    return Poll::Ready(None);
                }
                if let Some(stall) = this.stall {
                    this.stall_timer = Some(Box::pin(tokio::time::sleep(stall)));
                }
                if let Some(remaining) = &mut this.remaining {
                    *remaining -= 1;
                    if *remaining == 0 {
                        this.finish();
                    }
                }
                Poll::Ready(Some(message))
            }
            // The mux shut down with the connection.
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if let Some(deadline) = &mut this.deadline {
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.finish();
                        return Poll::Ready(None);
                    }
                }
                if let Some(stall_timer) = &mut this.stall_timer {
                    if stall_timer.as_mut().poll(cx).is_ready() {
                        this.finish();
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for Replies {
    fn drop(&mut self) {
        self.finish();
    }
}
