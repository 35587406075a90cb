//! Protocol frames and the JSON bodies exchanged during the handshake.
//!
//! Inbound frames are produced by [`crate::parser::Parser`]; outbound
//! control lines are built by the `encode_*` helpers and handed to the
//! buffered writer as ready-to-send fragments.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::headers::HeaderMap;

/// Maximum accepted length of a single control line.
pub const MAX_CONTROL_LINE: usize = 4096;

/// One parsed unit of the wire protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `+OK` acknowledgement (verbose mode).
    Ok,
    /// `-ERR '<text>'` server error.
    Err(String),
    /// `INFO {json}` greeting or gossip update.
    Info(ServerInfo),
    /// `PING` liveness probe.
    Ping,
    /// `PONG` liveness reply.
    Pong,
    /// `MSG` / `HMSG` message delivery.
    Message {
        /// Subject the message was published to.
        subject: String,
        /// Subscription id the server routed the message to.
        sid: u64,
        /// Reply subject, when the publisher requested one.
        reply: Option<String>,
        /// Decoded header block for `HMSG` deliveries.
        headers: Option<HeaderMap>,
        /// Message body, header bytes excluded.
        payload: Bytes,
    },
}

/// Server greeting and gossip fields carried by `INFO`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerInfo {
    /// Unique identifier of the server.
    pub server_id: String,
    /// Human-readable server name.
    pub server_name: String,
    /// Server software version.
    pub version: String,
    /// Listening host.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Protocol revision spoken by the server.
    pub proto: i32,
    /// Maximum payload size the server accepts.
    pub max_payload: usize,
    /// Whether the server requires authentication.
    pub auth_required: bool,
    /// Whether the server requires TLS.
    pub tls_required: bool,
    /// Nonce to sign when challenge authentication is in use.
    pub nonce: Option<String>,
    /// Cluster peer addresses for server-pool gossip.
    pub connect_urls: Vec<String>,
    /// Whether the server is shutting down gracefully.
    #[serde(rename = "ldm")]
    pub lame_duck_mode: bool,
    /// Whether the server supports header-bearing messages.
    pub headers: bool,
}

/// Client handshake body sent as `CONNECT {json}`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectInfo {
    /// Echo `+OK` for every command.
    pub verbose: bool,
    /// Stricter server-side subject checking.
    pub pedantic: bool,
    /// Implementation language of this client.
    pub lang: &'static str,
    /// Version of this client.
    pub version: &'static str,
    /// Protocol revision the client speaks.
    pub protocol: i32,
    /// Whether the server should echo the client's own publishes back.
    pub echo: bool,
    /// Whether the client understands header-bearing messages.
    pub headers: bool,
    /// Whether the client wants 503 replies for requests with no listener.
    pub no_responders: bool,
    /// Optional client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Username credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Token credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Public key identifying a nonce signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Signature over the server-supplied nonce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Encode a `CONNECT` control line.
///
/// # Panics
///
/// Panics if `info` fails to serialize, which cannot happen for a struct of
/// plain strings and booleans.
#[must_use]
pub(crate) fn encode_connect(info: &ConnectInfo) -> Bytes {
    let body = serde_json::to_string(info).expect("ConnectInfo serializes infallibly");
    let mut buf = BytesMut::with_capacity(body.len() + 12);
    buf.put_slice(b"CONNECT ");
    buf.put_slice(body.as_bytes());
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Encode a `PUB` or `HPUB` exchange as ready-to-write fragments.
#[must_use]
pub(crate) fn encode_publish(
    subject: &str,
    reply: Option<&str>,
    headers: Option<&HeaderMap>,
    payload: &Bytes,
) -> Vec<Bytes> {
    let mut control = BytesMut::with_capacity(subject.len() + 32);
    match headers {
        Some(headers) => {
            let block = headers.encode();
            control.put_slice(b"HPUB ");
            control.put_slice(subject.as_bytes());
            if let Some(reply) = reply {
                control.put_slice(b" ");
                control.put_slice(reply.as_bytes());
            }
            let header_len = block.len();
            let total_len = header_len + payload.len();
            control.put_slice(format!(" {header_len} {total_len}\r\n").as_bytes());
            vec![
                control.freeze(),
                block,
                payload.clone(),
                Bytes::from_static(b"\r\n"),
            ]
        }
        None => {
            control.put_slice(b"PUB ");
            control.put_slice(subject.as_bytes());
            if let Some(reply) = reply {
                control.put_slice(b" ");
                control.put_slice(reply.as_bytes());
            }
            control.put_slice(format!(" {}\r\n", payload.len()).as_bytes());
            vec![control.freeze(), payload.clone(), Bytes::from_static(b"\r\n")]
        }
    }
}

/// Encode a `SUB` control line.
#[must_use]
pub(crate) fn encode_subscribe(subject: &str, queue_group: Option<&str>, sid: u64) -> Bytes {
    let line = match queue_group {
        Some(group) => format!("SUB {subject} {group} {sid}\r\n"),
        None => format!("SUB {subject} {sid}\r\n"),
    };
    Bytes::from(line)
}

/// Encode an `UNSUB` control line, optionally bounded by a message count.
#[must_use]
pub(crate) fn encode_unsubscribe(sid: u64, max: Option<u64>) -> Bytes {
    let line = match max {
        Some(max) => format!("UNSUB {sid} {max}\r\n"),
        None => format!("UNSUB {sid}\r\n"),
    };
    Bytes::from(line)
}

/// `PING` control line.
pub(crate) const PING: &[u8] = b"PING\r\n";
/// `PONG` control line.
pub(crate) const PONG: &[u8] = b"PONG\r\n";
