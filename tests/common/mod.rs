//! In-memory protocol server for integration tests.
//!
//! A [`MockDialer`] hands the client one end of a duplex pipe per dial and
//! queues the other end for the test to drive; [`ServerConn`] implements
//! just enough of the wire protocol to handshake and script exchanges.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{Mutex, mpsc},
};

use subwire::{
    server_pool::ServerAddr,
    transport::{BoxedTransport, Dialer},
};

pub const DEFAULT_INFO: &str =
    r#"{"server_id":"mock","max_payload":1048576,"headers":true,"proto":1}"#;

/// Dialer producing in-memory duplex transports.
pub struct MockDialer {
    accepts: Arc<Mutex<mpsc::UnboundedSender<DuplexStream>>>,
}

/// Route crate tracing to the test writer; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accepts: Arc::new(Mutex::new(tx)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _addr: &ServerAddr) -> std::io::Result<BoxedTransport> {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        self.accepts
            .lock()
            .await
            .send(server_end)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no acceptor"))?;
        Ok(Box::new(client_end))
    }
}

/// Server side of one accepted connection.
pub struct ServerConn {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl ServerConn {
    pub async fn accept(accepts: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Self {
        let stream = accepts.recv().await.expect("client never dialed");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Greet the client and complete the handshake, returning the CONNECT
    /// body the client sent.
    pub async fn handshake(&mut self) -> String {
        self.handshake_with(DEFAULT_INFO).await
    }

    pub async fn handshake_with(&mut self, info: &str) -> String {
        self.send(format!("INFO {info}\r\n").as_bytes()).await;
        let connect = self.read_line().await;
        assert!(connect.starts_with("CONNECT "), "got {connect:?}");
        let ping = self.read_line().await;
        assert_eq!(ping, "PING");
        self.send(b"PONG\r\n").await;
        connect
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("server write");
        self.stream.flush().await.expect("server flush");
    }

    /// Read one CRLF-terminated line, without the terminator.
    pub async fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.drain(..pos + 2).take(pos).collect::<Vec<u8>>();
                return String::from_utf8(line).expect("non-UTF-8 control line");
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.expect("server read");
            assert!(n > 0, "client hung up mid-line");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read exactly `n` raw bytes.
    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 4096];
            let read = self.stream.read(&mut chunk).await.expect("server read");
            assert!(read > 0, "client hung up mid-payload");
            self.buf.extend_from_slice(&chunk[..read]);
        }
        self.buf.drain(..n).collect()
    }

    pub async fn expect_line(&mut self, expected: &str) {
        let line = self.read_line().await;
        assert_eq!(line, expected);
    }

    /// Read a `PUB`/`HPUB` control line plus payload; returns
    /// `(subject, reply, payload)` with header bytes included in the
    /// payload for `HPUB`.
    pub async fn read_publish(&mut self) -> (String, Option<String>, Vec<u8>) {
        let line = self.read_line().await;
        let mut parts = line.split_whitespace();
        let verb = parts.next().expect("empty control line");
        assert!(verb == "PUB" || verb == "HPUB", "got {line:?}");
        let args: Vec<&str> = parts.collect();
        let (subject, reply, total) = match (verb, args.as_slice()) {
            ("PUB", [subject, total]) => (subject, None, total),
            ("PUB", [subject, reply, total]) => (subject, Some((*reply).to_owned()), total),
            ("HPUB", [subject, _hdr, total]) => (subject, None, total),
            ("HPUB", [subject, reply, _hdr, total]) => {
                (subject, Some((*reply).to_owned()), total)
            }
            _ => panic!("malformed publish: {line:?}"),
        };
        let total: usize = total.parse().expect("bad total length");
        let payload = self.read_exact(total).await;
        // Trailing CRLF.
        assert_eq!(self.read_exact(2).await, b"\r\n");
        ((*subject).to_owned(), reply, payload)
    }

    /// Read a `SUB` line; returns `(subject, queue_group, sid)`.
    pub async fn read_sub(&mut self) -> (String, Option<String>, u64) {
        let line = self.read_line().await;
        let mut parts = line.split_whitespace();
        assert_eq!(parts.next(), Some("SUB"), "got {line:?}");
        let args: Vec<&str> = parts.collect();
        match args.as_slice() {
            [subject, sid] => ((*subject).to_owned(), None, sid.parse().expect("bad sid")),
            [subject, queue, sid] => (
                (*subject).to_owned(),
                Some((*queue).to_owned()),
                sid.parse().expect("bad sid"),
            ),
            _ => panic!("malformed SUB: {line:?}"),
        }
    }

    /// Deliver a plain message.
    pub async fn deliver(&mut self, subject: &str, sid: u64, reply: Option<&str>, payload: &[u8]) {
        let mut frame = match reply {
            Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()).into_bytes(),
            None => format!("MSG {subject} {sid} {}\r\n", payload.len()).into_bytes(),
        };
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await;
    }

    /// Deliver a header-bearing message built from raw header block bytes.
    pub async fn deliver_with_headers(
        &mut self,
        subject: &str,
        sid: u64,
        reply: Option<&str>,
        headers: &[u8],
        payload: &[u8],
    ) {
        let total = headers.len() + payload.len();
        let mut frame = match reply {
            Some(reply) => {
                format!("HMSG {subject} {sid} {reply} {} {total}\r\n", headers.len()).into_bytes()
            }
            None => format!("HMSG {subject} {sid} {} {total}\r\n", headers.len()).into_bytes(),
        };
        frame.extend_from_slice(headers);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await;
    }

    /// Deliver a header-only status message, e.g. a 503 or a pull discard.
    pub async fn deliver_status(
        &mut self,
        subject: &str,
        sid: u64,
        reply: Option<&str>,
        status_line: &str,
        entries: &[(&str, &str)],
    ) {
        let mut block = format!("PROTO/1.0 {status_line}\r\n");
        for (key, value) in entries {
            block.push_str(&format!("{key}: {value}\r\n"));
        }
        block.push_str("\r\n");
        self.deliver_with_headers(subject, sid, reply, block.as_bytes(), b"")
            .await;
    }

    /// Drop the connection.
    pub fn close(self) {
        drop(self.stream);
    }
}
