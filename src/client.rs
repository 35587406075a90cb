//! Public client handle.
//!
//! A [`Client`] is a cheap clone over one background connection task. Every
//! operation is a command sent over a bounded channel; the task serializes
//! all wire traffic and table mutation, so handles can be shared across
//! tasks freely.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tokio::sync::{OnceCell, broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::ClientConfig,
    connection::{Command, ConnectionDriver},
    error::{ConnectError, Error, RequestError, Result},
    events::{ConnState, Event, Events},
    frame::ServerInfo,
    headers::{HeaderMap, STATUS_NO_RESPONDERS},
    message::Message,
    request::{PendingEntry, Replies, RequestMux, Termination, new_token, reply_token},
    server_pool::{ServerAddr, ServerPool},
    subscription::Subscriber,
    transport::{Dialer, TcpDialer},
};

/// Depth of the command channel between handles and the connection task.
const COMMAND_CAPACITY: usize = 1024;

/// Depth of the status-event broadcast buffer.
const EVENT_CAPACITY: usize = 64;

/// Handle to one client instance.
///
/// Cloning shares the underlying connection; the background task stops once
/// every clone is dropped or [`close`](Client::close) is called.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    commands: mpsc::Sender<Command>,
    config: ClientConfig,
    mux: Arc<RequestMux>,
    /// Wildcard prefix of the shared reply inbox, without the trailing `.*`.
    mux_prefix: String,
    /// Set up lazily by the first mux-based request.
    mux_ready: OnceCell<()>,
    next_sid: Arc<AtomicU64>,
    state: watch::Receiver<ConnState>,
    info: watch::Receiver<ServerInfo>,
    events: broadcast::Sender<Event>,
    shutdown: CancellationToken,
}

impl Client {
    /// Connect over TCP using `config`.
    ///
    /// Resolves once the first connection is established, or fails with the
    /// terminal error of the initial connect loop.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when no server could be reached, the
    /// handshake was rejected, or authentication was aborted.
    pub async fn connect(config: ClientConfig) -> Result<Self, ConnectError> {
        Self::connect_with(config, Arc::new(TcpDialer::default())).await
    }

    /// Connect using an injected dialer, for custom transports and tests.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn connect_with(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, ConnectError> {
        let seeds: Vec<ServerAddr> = config
            .servers
            .iter()
            .map(|server| ServerAddr::parse(server))
            .collect();
        if seeds.is_empty() {
            return Err(ConnectError::NoServers);
        }
        let pool = ServerPool::new(seeds, config.randomize_servers);

        let (state_tx, state_rx) = watch::channel(ConnState::Idle);
        let (info_tx, info_rx) = watch::channel(ServerInfo::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let mux = Arc::new(RequestMux::default());
        let shutdown = CancellationToken::new();

        let driver = ConnectionDriver::new(
            config.clone(),
            dialer,
            pool,
            mux.clone(),
            state_tx,
            info_tx,
            events_tx.clone(),
            shutdown.clone(),
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(driver.run(command_rx, ready_tx));
        ready_rx
            .await
            .map_err(|_| ConnectError::Handshake("connection task stopped".into()))??;

        let mux_prefix = format!("{}.{}", config.inbox_prefix, new_token());
        Ok(Self {
            inner: Arc::new(Inner {
                commands: command_tx,
                config,
                mux,
                mux_prefix,
                mux_ready: OnceCell::new(),
                next_sid: Arc::new(AtomicU64::new(1)),
                state: state_rx,
                info: info_rx,
                events: events_tx,
                shutdown,
            }),
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.inner.state.borrow()
    }

    /// Most recent `INFO` received from the server.
    #[must_use]
    pub fn server_info(&self) -> ServerInfo {
        self.inner.info.borrow().clone()
    }

    /// Subscribe to the status-event stream.
    #[must_use]
    pub fn events(&self) -> Events {
        Events(self.inner.events.subscribe())
    }

    /// Generate a fresh reply-inbox subject.
    #[must_use]
    pub fn new_inbox(&self) -> String {
        format!("{}.{}", self.inner.config.inbox_prefix, new_token())
    }

    /// Publish `payload` to `subject`.
    ///
    /// The write is buffered and coalesced with other publishes; use
    /// [`flush`](Self::flush) to force it onto the wire.
    ///
    /// # Errors
    ///
    /// Fails synchronously on a bad subject, an oversized payload, or a
    /// draining/closed client.
    pub async fn publish(&self, subject: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_message(subject.into(), None, None, payload.into())
            .await
    }

    /// Publish with a reply subject for the receiver to respond to.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish); the reply subject is validated
    /// like the subject.
    pub async fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_message(subject.into(), Some(reply.into()), None, payload.into())
            .await
    }

    /// Publish with a header block (`HPUB` on the wire).
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub async fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_message(subject.into(), None, Some(headers), payload.into())
            .await
    }

    pub(crate) async fn publish_message(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        validate_subject(&subject)?;
        if let Some(reply) = &reply {
            validate_subject(reply)?;
        }
        self.check_publishable()?;
        let max = self.inner.info.borrow().max_payload;
        if max > 0 && payload.len() > max {
            return Err(Error::MaxPayloadExceeded {
                size: payload.len(),
                max,
            });
        }
        self.send(Command::Publish {
            subject,
            reply,
            headers,
            payload,
        })
        .await
    }

    /// Subscribe to `subject`.
    ///
    /// # Errors
    ///
    /// Fails on a bad subject or a draining/closed client.
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber> {
        self.subscribe_inner(subject.into(), None, None).await
    }

    /// Subscribe as a member of `queue_group`; the server delivers each
    /// message to one member of the group.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<Subscriber> {
        self.subscribe_inner(subject.into(), Some(queue_group.into()), None)
            .await
    }

    pub(crate) async fn subscribe_inner(
        &self,
        subject: String,
        queue_group: Option<String>,
        max: Option<u64>,
    ) -> Result<Subscriber> {
        validate_subject(&subject)?;
        self.check_publishable()?;
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_capacity);
        self.send(Command::Subscribe {
            sid,
            subject: subject.clone(),
            queue_group,
            max,
            tx,
        })
        .await?;
        Ok(Subscriber::new(
            sid,
            subject,
            rx,
            self.inner.commands.clone(),
            self.inner.next_sid.clone(),
        ))
    }

    /// Send a request and await its single reply.
    ///
    /// All requests share one inbox subscription; replies are correlated by
    /// a random token. The configured request timeout applies.
    ///
    /// # Errors
    ///
    /// [`RequestError::Timeout`] when no reply arrives in time,
    /// [`RequestError::NoResponders`] on a 503 status reply, and
    /// [`RequestError::ConnectionClosed`] when the client closes first.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Message> {
        Ok(self
            .request_inner(subject.into(), None, payload.into(), None)
            .await?)
    }

    /// Send a request with headers and await its single reply.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<Message> {
        Ok(self
            .request_inner(subject.into(), Some(headers), payload.into(), None)
            .await?)
    }

    pub(crate) async fn request_inner(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Option<std::time::Duration>,
    ) -> Result<Message, RequestError> {
        self.ensure_mux().await?;
        let token = new_token();
        let rx = self.inner.mux.register_single(token.clone());
        // Clears the table entry on every exit path, a caller dropping this
        // future mid-flight included.
        let _pending = PendingEntry::new(self.inner.mux.clone(), token.clone());
        let reply = format!("{}.{}", self.inner.mux_prefix, token);
        if let Err(error) = self
            .publish_message(subject, Some(reply), headers, payload)
            .await
        {
            return Err(RequestError::Publish(Box::new(error)));
        }

        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Err(_elapsed) => Err(RequestError::Timeout),
            Ok(Err(_closed)) => Err(RequestError::ConnectionClosed),
            Ok(Ok(reply)) => {
                if reply.status() == Some(STATUS_NO_RESPONDERS) {
                    return Err(RequestError::NoResponders);
                }
                Ok(reply)
            }
        }
    }

    /// Send a request and stream every reply until `termination` fires.
    ///
    /// # Errors
    ///
    /// Fails only if the request itself cannot be published; termination
    /// conditions end the stream rather than erroring.
    pub async fn request_many(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        termination: Termination,
    ) -> Result<Replies> {
        self.ensure_mux().await.map_err(Error::Request)?;
        let token = new_token();
        let rx = self
            .inner
            .mux
            .register_stream(token.clone(), self.inner.config.subscription_capacity);
        let reply = format!("{}.{}", self.inner.mux_prefix, token);
        if let Err(error) = self
            .publish_message(subject.into(), Some(reply), None, payload.into())
            .await
        {
            self.inner.mux.remove(&token);
            return Err(error);
        }
        Ok(Replies::new(rx, self.inner.mux.clone(), token, termination))
    }

    /// Send a request over a dedicated throwaway inbox subscription.
    ///
    /// Correlation shares no state with concurrent requests; used where a
    /// private reply subject is required.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_no_mux(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Message> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe_inner(inbox.clone(), None, Some(1)).await?;
        self.publish_message(subject.into(), Some(inbox), None, payload.into())
            .await?;
        match tokio::time::timeout(self.inner.config.request_timeout, sub.next()).await {
            Err(_elapsed) => Err(RequestError::Timeout.into()),
            Ok(None) => Err(RequestError::ConnectionClosed.into()),
            Ok(Some(reply)) => {
                if reply.status() == Some(STATUS_NO_RESPONDERS) {
                    return Err(RequestError::NoResponders.into());
                }
                Ok(reply)
            }
        }
    }

    /// Flush all buffered writes and wait for the transport write to finish.
    ///
    /// # Errors
    ///
    /// Fails when the transport write fails or the client is closed.
    pub async fn flush(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Flush { done }).await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Tear down the current transport and let the reconnect loop pick a
    /// new server.
    ///
    /// # Errors
    ///
    /// Fails when the client is already closed.
    pub async fn force_reconnect(&self) -> Result<()> {
        self.send(Command::ForceReconnect).await
    }

    /// Flush all subscriptions, then close the client.
    ///
    /// In-flight deliveries already buffered for subscribers remain
    /// readable; new publishes are rejected once draining starts.
    pub async fn drain(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Drain { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Close immediately. Every pending request and subscription resolves
    /// with a terminal error.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Cancelled once the connection task finalizes; background loops tied
    /// to this client stop on it.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| Error::Closed)
    }

    fn check_publishable(&self) -> Result<()> {
        match self.state() {
            ConnState::Draining => Err(Error::Draining),
            ConnState::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    /// Set up the shared reply-inbox subscription on first use.
    async fn ensure_mux(&self) -> Result<(), RequestError> {
        if self.inner.mux.is_closed() {
            return Err(RequestError::ConnectionClosed);
        }
        let inner = &self.inner;
        inner
            .mux_ready
            .get_or_try_init(|| async {
                let subject = format!("{}.*", inner.mux_prefix);
                let sid = inner.next_sid.fetch_add(1, Ordering::Relaxed);
                let (tx, mut rx) = mpsc::channel(inner.config.subscription_capacity);
                inner
                    .commands
                    .send(Command::Subscribe {
                        sid,
                        subject,
                        queue_group: None,
                        max: None,
                        tx,
                    })
                    .await
                    .map_err(|_| RequestError::ConnectionClosed)?;
                let mux = inner.mux.clone();
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        let token = reply_token(&message.subject).to_owned();
                        if !mux.resolve(&token, message) {
                            debug!(token, "unmatched inbox reply dropped");
                        }
                    }
                });
                Ok(())
            })
            .await
            .map(|_ready| ())
    }
}

/// Reject empty subjects and subjects containing whitespace.
fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty()
        || subject
            .bytes()
            .any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
    {
        return Err(Error::BadSubject(subject.to_owned()));
    }
    Ok(())
}
