//! Connection manager.
//!
//! One task owns the transport, parser, subscription registry, server pool,
//! and outbound buffer; every public API call reaches it through a bounded
//! command channel, so no shared table is ever touched from two places
//! (the request-multiplexer token table, which has its own exclusive
//! boundary, excepted).
//!
//! The task drives the dial/handshake/reconnect state machine, answers
//! heartbeats, dispatches inbound frames, and publishes every state
//! transition on the status stream.

mod connector;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{broadcast, mpsc, oneshot, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::ClientConfig,
    error::{ConnectError, Error},
    events::{ConnState, Event},
    frame::{Frame, PING, PONG, ServerInfo, encode_publish, encode_subscribe, encode_unsubscribe},
    headers::HeaderMap,
    message::Message,
    metrics,
    parser::Parser,
    request::RequestMux,
    server_pool::{ServerAddr, ServerPool},
    subscription::{DispatchOutcome, Registry, SubEntry},
    transport::{BoxedTransport, Dialer},
    writer::OutboundBuffer,
};

use connector::Session;

/// Commands sent from public API handles to the connection task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue a publish.
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    /// Register a subscription under a pre-allocated sid.
    Subscribe {
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        max: Option<u64>,
        tx: mpsc::Sender<Message>,
    },
    /// Retire `old_sid` and continue the same subscription under `new_sid`.
    Resubscribe {
        old_sid: u64,
        new_sid: u64,
        subject: String,
    },
    /// Remove a subscription, or bound its remaining deliveries.
    Unsubscribe { sid: u64, max: Option<u64> },
    /// Stop server-side deliveries but let buffered messages drain.
    DrainSubscription { sid: u64 },
    /// Flush buffered writes through the transport.
    Flush {
        done: oneshot::Sender<Result<(), Error>>,
    },
    /// Tear down the current transport and reconnect.
    ForceReconnect,
    /// Flush all subscriptions, then close.
    Drain { done: oneshot::Sender<()> },
    /// Close immediately, rejecting all pending state.
    Close { done: oneshot::Sender<()> },
}

/// Why the serve loop returned.
enum Exit {
    /// Transport loss or protocol failure; run the reconnect loop.
    Reconnect,
    /// Client close or drain; the task must finalize and stop.
    Closed(Option<oneshot::Sender<()>>),
}

/// Reading side of an established connection, handed to the serve loop.
struct LiveConn {
    reader: ReadHalf<BoxedTransport>,
    parser: Parser,
    /// Frames that arrived behind the handshake reply.
    pending: VecDeque<Frame>,
}

/// Outcome of the reconnect loop.
enum Established {
    Live(LiveConn),
    /// Unrecoverable: empty pool or aborted authentication.
    Terminal(ConnectError),
    Closed(Option<oneshot::Sender<()>>),
}

/// State owned by the connection task.
pub(crate) struct ConnectionDriver {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    pool: ServerPool,
    registry: Registry,
    mux: Arc<RequestMux>,
    writer: OutboundBuffer,
    sink: Option<WriteHalf<BoxedTransport>>,
    state_tx: watch::Sender<ConnState>,
    info_tx: watch::Sender<ServerInfo>,
    events: broadcast::Sender<Event>,
    shutdown: CancellationToken,
    outstanding_pings: u32,
    last_auth_error: Option<String>,
    /// Endpoint of the live connection, excluded from gossip removal.
    current: Option<(String, u16)>,
    /// Flush waiters parked while the client is between connections.
    flush_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
}

impl ConnectionDriver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        pool: ServerPool,
        mux: Arc<RequestMux>,
        state_tx: watch::Sender<ConnState>,
        info_tx: watch::Sender<ServerInfo>,
        events: broadcast::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Self {
        let flush_threshold = config.flush_threshold;
        Self {
            config,
            dialer,
            pool,
            registry: Registry::default(),
            mux,
            writer: OutboundBuffer::new(flush_threshold),
            sink: None,
            state_tx,
            info_tx,
            events,
            shutdown,
            outstanding_pings: 0,
            last_auth_error: None,
            current: None,
            flush_waiters: Vec::new(),
        }
    }

    /// Drive the connection until close. `ready` resolves once the first
    /// connect succeeds or fails terminally.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        ready: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        let mut ready = Some(ready);
        loop {
            let live = match self.establish(&mut commands).await {
                Established::Live(live) => live,
                Established::Terminal(error) => {
                    warn!(%error, "connection failed terminally");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(error));
                    }
                    self.finalize(None);
                    return;
                }
                Established::Closed(done) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(ConnectError::NoServers));
                    }
                    self.finalize(done);
                    return;
                }
            };
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }

            match self.serve(live, &mut commands).await {
                Exit::Reconnect => {
                    metrics::record_disconnect();
                    self.sink = None;
                    self.current = None;
                    self.outstanding_pings = 0;
                    let _ = self.events.send(Event::Disconnected);
                    self.set_state(ConnState::Reconnecting);
                }
                Exit::Closed(done) => {
                    self.finalize(done);
                    return;
                }
            }
        }
    }

    /// Reconnect loop: rotate the pool, honor per-server retry intervals
    /// and backoff, evict servers past the attempt cap, and abort on
    /// repeated identical authentication errors.
    async fn establish(&mut self, commands: &mut mpsc::Receiver<Command>) -> Established {
        if *self.state_tx.borrow() == ConnState::Idle {
            self.set_state(ConnState::Connecting);
        }
        loop {
            let Some(server) = self.pool.select() else {
                return Established::Terminal(ConnectError::NoServers);
            };

            let mut delay =
                ServerPool::retry_delay(&server, self.config.reconnect.min_retry_interval);
            if server.reconnects > 0 {
                delay = delay.max(self.backoff_delay(server.reconnects));
            }
            if !delay.is_zero() {
                if let Some(done) = self.wait_offline(delay, commands).await {
                    return Established::Closed(done);
                }
            }

            if *self.state_tx.borrow() == ConnState::Reconnecting {
                let _ = self.events.send(Event::Reconnecting {
                    server: server.to_string(),
                });
            }
            let attempts = self.pool.note_attempt(&server.host, server.port);

            let attempt = tokio::time::timeout(
                self.config.reconnect.connect_timeout,
                connector::connect(self.dialer.as_ref(), &self.config, &server),
            )
            .await;
            let error = match attempt {
                Ok(Ok(session)) => match self.activate(session, &server).await {
                    Some(live) => return Established::Live(live),
                    // Activation flush failed; treat like a dial failure.
                    None => ConnectError::Handshake("connection lost during activation".into()),
                },
                Ok(Err(error)) => error,
                Err(_elapsed) => ConnectError::Timeout,
            };

            debug!(server = %server, %error, "connection attempt failed");
            if let ConnectError::AuthFailed(message) = &error {
                if self.note_auth_failure(message) {
                    return Established::Terminal(ConnectError::AuthAborted(message.clone()));
                }
            }
            if attempts >= self.config.reconnect.max_attempts_per_server
                && self.pool.evict(&server.host, server.port)
            {
                debug!(server = %server, attempts, "server evicted from pool");
                let _ = self.events.send(Event::ServersChanged {
                    added: Vec::new(),
                    removed: vec![server.to_string()],
                });
            }
        }
    }

    /// Flip a fresh session into the connected state: replay the
    /// subscription registry, flush buffered writes, release flush waiters.
    async fn activate(&mut self, session: Session, server: &ServerAddr) -> Option<LiveConn> {
        let Session {
            reader,
            sink,
            parser,
            pending,
            info,
        } = session;
        self.sink = Some(sink);
        self.outstanding_pings = 0;
        self.last_auth_error = None;
        self.pool.note_success(&server.host, server.port);
        self.current = Some((server.host.clone(), server.port));
        self.apply_info(info);

        // Re-establish every live subscription before resuming traffic.
        let replay = self.registry.replay();
        let had_replay = !replay.is_empty();
        for line in replay {
            self.writer.enqueue(line);
        }
        if self.flush().await.is_err() {
            self.sink = None;
            self.current = None;
            return None;
        }
        if had_replay {
            debug!("subscription registry replayed");
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        metrics::record_connect();
        self.set_state(ConnState::Connected);
        let _ = self.events.send(Event::Connected);
        Some(LiveConn {
            reader,
            parser,
            pending,
        })
    }

    /// Serve one established connection until loss or close.
    async fn serve(&mut self, live: LiveConn, commands: &mut mpsc::Receiver<Command>) -> Exit {
        let LiveConn {
            mut reader,
            mut parser,
            pending,
        } = live;

        for frame in pending {
            if let Some(exit) = self.handle_frame(frame) {
                return exit;
            }
        }

        let mut read_buf = BytesMut::with_capacity(64 * 1024);
        let mut frames = Vec::new();
        let mut ping_timer = tokio::time::interval(self.config.ping.interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.reset();

        loop {
            // End-of-turn flush: coalesces every fragment queued during the
            // previous turn into one transport write.
            if !self.writer.is_empty() && self.flush().await.is_err() {
                return Exit::Reconnect;
            }

            tokio::select! {
                biased;

                _ = ping_timer.tick() => {
                    self.outstanding_pings += 1;
                    if self.outstanding_pings > self.config.ping.max_outstanding {
                        warn!("connection stale: unanswered heartbeats");
                        let _ = self.events.send(Event::StaleConnection);
                        return Exit::Reconnect;
                    }
                    self.writer.enqueue(Bytes::from_static(PING));
                }

                read = reader.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => return Exit::Reconnect,
                        Ok(_) => {}
                        Err(error) => {
                            debug!(%error, "transport read failed");
                            return Exit::Reconnect;
                        }
                    }
                    frames.clear();
                    let parsed = parser.feed(&read_buf, &mut frames);
                    read_buf.clear();
                    if let Err(error) = parsed {
                        warn!(%error, "protocol error; dropping connection");
                        metrics::record_error();
                        return Exit::Reconnect;
                    }
                    for frame in frames.drain(..) {
                        if let Some(exit) = self.handle_frame(frame) {
                            return exit;
                        }
                    }
                }

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        // Every client handle is gone.
                        return Exit::Closed(None);
                    };
                    if let Some(exit) = self.handle_command(cmd, true).await {
                        return exit;
                    }
                    // Coalesce a synchronous burst into this turn's flush.
                    while let Ok(cmd) = commands.try_recv() {
                        if let Some(exit) = self.handle_command(cmd, true).await {
                            return exit;
                        }
                    }
                }
            }
        }
    }

    /// Apply one command. `online` selects whether wire traffic is
    /// generated; offline, registry changes alone suffice because the
    /// registry is replayed on reconnect.
    async fn handle_command(&mut self, cmd: Command, online: bool) -> Option<Exit> {
        match cmd {
            Command::Publish {
                subject,
                reply,
                headers,
                payload,
            } => {
                let fragments =
                    encode_publish(&subject, reply.as_deref(), headers.as_ref(), &payload);
                self.writer.enqueue_all(fragments);
                metrics::record_publish();
                if online && self.writer.should_flush() && self.flush().await.is_err() {
                    return Some(Exit::Reconnect);
                }
            }
            Command::Subscribe {
                sid,
                subject,
                queue_group,
                max,
                tx,
            } => {
                if online {
                    self.writer
                        .enqueue(encode_subscribe(&subject, queue_group.as_deref(), sid));
                    if let Some(max) = max {
                        self.writer.enqueue(encode_unsubscribe(sid, Some(max)));
                    }
                }
                self.registry.insert(
                    sid,
                    SubEntry {
                        subject,
                        queue_group,
                        max,
                        received: 0,
                        tx,
                    },
                );
            }
            Command::Resubscribe {
                old_sid,
                new_sid,
                subject,
            } => {
                if self.registry.rebind(old_sid, new_sid, subject.clone()) && online {
                    self.writer.enqueue(encode_unsubscribe(old_sid, None));
                    self.writer
                        .enqueue(encode_subscribe(&subject, None, new_sid));
                }
            }
            Command::Unsubscribe { sid, max } => match max {
                None => {
                    if self.registry.remove(sid).is_some() && online {
                        self.writer.enqueue(encode_unsubscribe(sid, None));
                    }
                }
                Some(max) => {
                    if self.registry.contains(sid) {
                        if online {
                            self.writer.enqueue(encode_unsubscribe(sid, Some(max)));
                        }
                        self.registry.set_max(sid, max);
                    }
                }
            },
            Command::DrainSubscription { sid } => {
                // Dropping the entry's sender ends the subscriber's stream
                // once its buffered messages are consumed.
                if self.registry.remove(sid).is_some() && online {
                    self.writer.enqueue(encode_unsubscribe(sid, None));
                }
            }
            Command::Flush { done } => {
                if online {
                    let result = self.flush().await.map_err(Error::Io);
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        return Some(Exit::Reconnect);
                    }
                } else {
                    self.flush_waiters.push(done);
                }
            }
            Command::ForceReconnect => {
                if online {
                    return Some(Exit::Reconnect);
                }
            }
            Command::Drain { done } => {
                self.set_state(ConnState::Draining);
                if online {
                    for sid in self.registry.sids() {
                        self.writer.enqueue(encode_unsubscribe(sid, None));
                    }
                    let _ = self.flush().await;
                }
                self.registry.clear();
                let _ = done.send(());
                return Some(Exit::Closed(None));
            }
            Command::Close { done } => return Some(Exit::Closed(Some(done))),
        }
        None
    }

    /// Dispatch one inbound frame.
    fn handle_frame(&mut self, frame: Frame) -> Option<Exit> {
        metrics::record_frame();
        match frame {
            Frame::Ok => {}
            Frame::Ping => self.writer.enqueue(Bytes::from_static(PONG)),
            Frame::Pong => self.outstanding_pings = 0,
            Frame::Err(message) => {
                metrics::record_error();
                let abort = connector::is_auth_error(&message) && self.note_auth_failure(&message);
                let _ = self.events.send(Event::ServerError(message));
                if abort {
                    return Some(Exit::Closed(None));
                }
            }
            Frame::Info(info) => self.apply_info(info),
            Frame::Message {
                subject,
                sid,
                reply,
                headers,
                payload,
            } => {
                let message = Message {
                    subject,
                    sid,
                    reply,
                    headers,
                    payload,
                };
                if self.registry.dispatch(sid, message) == DispatchOutcome::Dropped {
                    metrics::record_dropped();
                }
            }
        }
        None
    }

    /// Fold a greeting or gossip `INFO` into client state.
    fn apply_info(&mut self, info: ServerInfo) {
        if !info.connect_urls.is_empty() {
            let current = self
                .current
                .as_ref()
                .map(|(host, port)| (host.as_str(), *port));
            let delta = self.pool.update_from_gossip(&info.connect_urls, current);
            if !delta.is_empty() {
                let _ = self.events.send(Event::ServersChanged {
                    added: delta.added,
                    removed: delta.removed,
                });
            }
        }
        if info.lame_duck_mode {
            let _ = self.events.send(Event::LameDuckMode);
        }
        self.info_tx.send_replace(info);
    }

    /// Write and flush everything queued in the outbound buffer.
    async fn flush(&mut self) -> std::io::Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        for chunk in self.writer.take() {
            sink.write_all(&chunk).await?;
        }
        sink.flush().await
    }

    /// Wait out a reconnect delay while still absorbing commands.
    ///
    /// Returns `Some` when a close or drain arrived; the inner option is
    /// the close acknowledgement channel.
    async fn wait_offline(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Option<Option<oneshot::Sender<()>>> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return None,
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        return Some(None);
                    };
                    match self.handle_command(cmd, false).await {
                        Some(Exit::Closed(done)) => return Some(done),
                        Some(Exit::Reconnect) | None => {}
                    }
                }
            }
        }
    }

    /// Exponential backoff with random jitter.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let reconnect = &self.config.reconnect;
        let exp = attempts.saturating_sub(1).min(16);
        let base = reconnect
            .backoff_base
            .saturating_mul(2_u32.saturating_pow(exp))
            .min(reconnect.backoff_max);
        let jitter_ms = u64::try_from(reconnect.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        base + jitter
    }

    /// Track consecutive identical authentication errors.
    ///
    /// Returns `true` when the second identical error in a row should abort
    /// reconnection; overridden by `ignore_auth_error_abort`.
    fn note_auth_failure(&mut self, message: &str) -> bool {
        let normalized = message.trim().to_ascii_lowercase();
        let repeated = self.last_auth_error.as_deref() == Some(normalized.as_str());
        self.last_auth_error = Some(normalized);
        repeated && !self.config.reconnect.ignore_auth_error_abort
    }

    /// Reject all pending state and stop.
    fn finalize(&mut self, done: Option<oneshot::Sender<()>>) {
        self.writer.reset();
        self.registry.clear();
        self.mux.shutdown();
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Closed));
        }
        self.shutdown.cancel();
        self.set_state(ConnState::Closed);
        let _ = self.events.send(Event::Closed);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state_tx.send_replace(state);
    }
}
