//! Error types for the client engine.
//!
//! The taxonomy mirrors the layers of the engine: parse errors are fatal to
//! the connection that produced them, connect errors are owned by the
//! reconnect loop, request errors are delivered only to the awaiting caller,
//! and consumer errors distinguish terminal flow-control conditions from
//! transient ones that the pull loop absorbs.

use std::io;

use thiserror::Error;

/// Wire-level errors produced by the frame parser.
///
/// Any of these is fatal to the active connection: the reconnect loop tears
/// the transport down and decides what happens next. The parser itself never
/// retries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Bytes at the start of a control line match no known verb.
    #[error("unknown protocol verb: {0:?}")]
    UnknownVerb(String),

    /// A control line was structurally malformed (wrong argument count,
    /// empty line, stray bytes).
    #[error("malformed control line: {0:?}")]
    BadControlLine(String),

    /// A numeric field was non-numeric or negative.
    #[error("invalid {field} in control line: {value:?}")]
    InvalidLength {
        /// Which field failed to parse.
        field: &'static str,
        /// The offending token.
        value: String,
    },

    /// The declared header length exceeds the declared total length.
    #[error("header length {header_len} exceeds total length {total_len}")]
    HeaderExceedsTotal {
        /// Declared header byte count.
        header_len: usize,
        /// Declared total byte count.
        total_len: usize,
    },

    /// A control line grew past the configured maximum.
    #[error("control line exceeds {max} bytes")]
    ControlLineTooLong {
        /// Maximum permitted control-line length.
        max: usize,
    },

    /// The header block of a header-bearing message was malformed.
    #[error("malformed header block: {0}")]
    BadHeaders(String),

    /// The JSON body of an INFO frame failed to deserialize.
    #[error("malformed INFO body: {0}")]
    BadInfo(String),

    /// A payload was not terminated by CRLF.
    #[error("payload missing CRLF terminator")]
    MissingPayloadTerminator,
}

/// Errors produced while establishing or re-establishing a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The transport could not be dialed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No servers remain in the pool.
    #[error("no servers available for connection")]
    NoServers,

    /// The dial or handshake did not complete within the attempt timeout.
    #[error("connection attempt timed out")]
    Timeout,

    /// The server rejected the handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The server rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The same authentication error repeated across consecutive attempts;
    /// the credential is assumed fatally invalid and reconnection aborted.
    #[error("authentication aborted after repeated failure: {0}")]
    AuthAborted(String),

    /// A nonce signer failed to produce a signature.
    #[error("signature error: {0}")]
    Signature(String),
}

/// Errors delivered to a caller awaiting a request/response exchange.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestError {
    /// No reply arrived within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The server reported that no subscriber was listening on the subject.
    #[error("no responders available for request")]
    NoResponders,

    /// The connection closed while the request was outstanding.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    /// Publishing the request failed.
    #[error(transparent)]
    Publish(#[from] Box<Error>),
}

/// Errors produced by the pull-consumer flow controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConsumerError {
    /// The server reported a terminal flow-control conflict. The stream is
    /// unusable and the caller must not retry the same pull.
    #[error("terminal consumer conflict ({code}): {description}")]
    Terminal {
        /// Protocol status code, 409-class.
        code: u16,
        /// Server-supplied description.
        description: String,
    },

    /// The configured number of idle heartbeats was missed in a row. The
    /// stream remains usable; the budget has been reset and a fresh pull
    /// issued.
    #[error("missed idle heartbeats from the server")]
    MissedHeartbeats,

    /// The stream API returned an error envelope.
    #[error("stream API error ({code}): {description}")]
    Api {
        /// HTTP-style status code from the API envelope.
        code: u16,
        /// Server-supplied description.
        description: String,
    },

    /// Ordered-consumer recovery exhausted its retry budget while the
    /// stream or consumer resource was missing.
    #[error("ordered consumer recovery failed after {attempts} attempts")]
    RecoveryFailed {
        /// Number of recreate attempts made.
        attempts: u32,
    },

    /// A delivered message carried an ack subject that could not be parsed.
    #[error("malformed ack metadata in reply subject: {0:?}")]
    BadAckMetadata(String),

    /// The stream API returned a body that could not be decoded.
    #[error("malformed stream API response: {0}")]
    BadResponse(String),

    /// An underlying request failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The connection closed underneath the consumer.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Top-level error type for client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A wire-protocol violation, fatal to the connection.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Connection establishment failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A request failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A pull consumer failed.
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    /// A transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The payload exceeds the server-advertised maximum.
    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayloadExceeded {
        /// Size of the rejected payload.
        size: usize,
        /// Server-advertised maximum.
        max: usize,
    },

    /// The subject contains whitespace or is empty.
    #[error("invalid subject: {0:?}")]
    BadSubject(String),

    /// The client is draining and no longer accepts publishes.
    #[error("client is draining")]
    Draining,

    /// The client is closed.
    #[error("client is closed")]
    Closed,
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
