//! Header sub-protocol codec.
//!
//! Header-bearing messages carry a block of bytes ahead of the payload: a
//! status line (`PROTO/1.0`, optionally followed by a numeric code and a
//! description) and zero or more `Key: Value` lines, terminated by a blank
//! line. Status codes of 300 and above denote protocol-level conditions
//! (404 no messages, 408 request timeout, 409 conflict, 503 no responders)
//! that upper layers interpret rather than deliver as payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ParseError;

/// Version token opening every header block.
pub const HEADER_VERSION: &str = "PROTO/1.0";

/// Status code carried on idle-heartbeat messages.
pub const STATUS_IDLE_HEARTBEAT: u16 = 100;
/// Status code for "no messages available" replies to a pull.
pub const STATUS_NO_MESSAGES: u16 = 404;
/// Status code for an expired pull request.
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Status code for consumer flow-control conflicts.
pub const STATUS_CONFLICT: u16 = 409;
/// Status code for "no responders" request replies.
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Header naming the number of messages a discard status leaves unfulfilled.
pub const PENDING_MESSAGES_HEADER: &str = "Pending-Messages";
/// Header naming the number of bytes a discard status leaves unfulfilled.
pub const PENDING_BYTES_HEADER: &str = "Pending-Bytes";

/// Ordered collection of headers plus the optional status line fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<u16>,
    description: Option<String>,
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Status code from the status line, if one was present.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Free-text description following the status code.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Set the status line fields.
    pub fn set_status(&mut self, code: u16, description: impl Into<String>) {
        self.status = Some(code);
        let description = description.into();
        self.description = (!description.is_empty()).then_some(description);
    }

    /// Append a header entry. Duplicate keys are kept in insertion order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value recorded for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the map holds neither a status nor any entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.entries.is_empty()
    }

    /// Parse a header block of exactly `header_len` bytes, including the
    /// terminating blank line.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::BadHeaders`] if the version token is missing,
    /// the status code is non-numeric, or an entry lacks a `:` separator.
    pub fn decode(block: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| ParseError::BadHeaders("header block is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| ParseError::BadHeaders("empty header block".into()))?;
        let rest = status_line
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| ParseError::BadHeaders(format!("bad version token: {status_line:?}")))?;

        let mut map = Self::new();
        let rest = rest.trim_start();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, description.trim()),
                None => (rest, ""),
            };
            let code: u16 = code
                .parse()
                .map_err(|_| ParseError::BadHeaders(format!("bad status code: {code:?}")))?;
            map.set_status(code, description);
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::BadHeaders(format!("missing separator: {line:?}")))?;
            map.insert(key.trim(), value.trim());
        }
        Ok(map)
    }

    /// Encode the block, including the terminating blank line.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(code) = self.status {
            buf.put_slice(format!(" {code}").as_bytes());
            if let Some(description) = &self.description {
                buf.put_slice(b" ");
                buf.put_slice(description.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        for (key, value) in &self.entries {
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
