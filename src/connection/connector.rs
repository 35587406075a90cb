//! Dial and handshake logic for a single connection attempt.
//!
//! One attempt: dial the transport, read the server `INFO`, answer with
//! `CONNECT` and a `PING`, and wait for the matching `PONG`. The whole
//! sequence races the configured connect timeout in the caller.

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{
    auth::Credentials,
    config::ClientConfig,
    error::{ConnectError, ParseError},
    frame::{ConnectInfo, Frame, PING, PONG, ServerInfo, encode_connect},
    parser::Parser,
    server_pool::ServerAddr,
    transport::{BoxedTransport, Dialer},
};

/// A freshly established connection, handed from the connector to the
/// serve loop.
pub(crate) struct Session {
    pub(crate) reader: ReadHalf<BoxedTransport>,
    pub(crate) sink: WriteHalf<BoxedTransport>,
    /// Parser bound to this connection. Replaced, never reset, on
    /// reconnect: framing state cannot span connections.
    pub(crate) parser: Parser,
    /// Frames that arrived behind the handshake `PONG`.
    pub(crate) pending: VecDeque<Frame>,
    pub(crate) info: ServerInfo,
}

/// Dial `server` and run the protocol handshake.
pub(crate) async fn connect(
    dialer: &dyn Dialer,
    config: &ClientConfig,
    server: &ServerAddr,
) -> Result<Session, ConnectError> {
    let transport = dialer.dial(server).await?;
    let (reader, mut sink) = tokio::io::split(transport);
    let mut handshake = HandshakeReader::new(reader);

    let info = loop {
        match handshake.next_frame().await? {
            Frame::Info(info) => break info,
            Frame::Err(message) => return Err(classify_server_error(&message)),
            Frame::Ping => {
                sink.write_all(PONG).await?;
                sink.flush().await?;
            }
            // Nothing else is meaningful before the greeting.
            other => {
                return Err(ConnectError::Handshake(format!(
                    "expected INFO greeting, got {other:?}"
                )));
            }
        }
    };

    let connect_body = connect_info(config, &info)?;
    sink.write_all(&encode_connect(&connect_body)).await?;
    sink.write_all(PING).await?;
    sink.flush().await?;

    loop {
        match handshake.next_frame().await? {
            Frame::Pong => break,
            Frame::Err(message) => return Err(classify_server_error(&message)),
            Frame::Ping => {
                sink.write_all(PONG).await?;
                sink.flush().await?;
            }
            Frame::Ok => {}
            // Gossip may arrive mid-handshake; keep it for the serve loop.
            other => handshake.pending.push_back(other),
        }
    }

    let HandshakeReader {
        reader,
        parser,
        pending,
        ..
    } = handshake;
    Ok(Session {
        reader,
        sink,
        parser,
        pending,
        info,
    })
}

/// Build the `CONNECT` body, applying credentials against the server nonce.
fn connect_info(config: &ClientConfig, info: &ServerInfo) -> Result<ConnectInfo, ConnectError> {
    let mut body = ConnectInfo {
        verbose: config.verbose,
        pedantic: config.pedantic,
        lang: "rust",
        version: env!("CARGO_PKG_VERSION"),
        protocol: 1,
        echo: config.echo,
        headers: true,
        no_responders: true,
        name: config.name.clone(),
        ..ConnectInfo::default()
    };
    match &config.credentials {
        Credentials::None => {}
        Credentials::UserPass { user, pass } => {
            body.user = Some(user.clone());
            body.pass = Some(pass.clone());
        }
        Credentials::Token(token) => body.auth_token = Some(token.clone()),
        Credentials::Signer(signer) => {
            if let Some(nonce) = &info.nonce {
                let signature = signer
                    .sign(nonce.as_bytes())
                    .map_err(|e| ConnectError::Signature(e.to_string()))?;
                body.public_key = Some(signer.public_key());
                body.signature = Some(signature);
            }
        }
    }
    Ok(body)
}

/// Map a handshake `-ERR` to the right error class.
pub(crate) fn classify_server_error(message: &str) -> ConnectError {
    if is_auth_error(message) {
        ConnectError::AuthFailed(message.to_owned())
    } else {
        ConnectError::Handshake(message.to_owned())
    }
}

/// Whether a server error text denotes an authentication failure.
pub(crate) fn is_auth_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("authorization") || lower.contains("authentication")
}

/// Reads frames during the handshake, before the serve loop owns the parser.
struct HandshakeReader {
    reader: ReadHalf<BoxedTransport>,
    parser: Parser,
    pending: VecDeque<Frame>,
    buf: BytesMut,
}

impl HandshakeReader {
    fn new(reader: ReadHalf<BoxedTransport>) -> Self {
        Self {
            reader,
            parser: Parser::new(),
            pending: VecDeque::new(),
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ConnectError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            self.buf.clear();
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ConnectError::Handshake(
                    "connection closed during handshake".into(),
                ));
            }
            let mut frames = Vec::new();
            self.parser
                .feed(&self.buf, &mut frames)
                .map_err(|e: ParseError| ConnectError::Handshake(e.to_string()))?;
            self.pending.extend(frames);
        }
    }
}
