//! Incremental wire-protocol parser.
//!
//! [`Parser::feed`] consumes raw stream bytes and appends complete frames to
//! the caller's buffer. Partial state never spans a frame boundary
//! incorrectly: an incomplete control line or payload at the end of one call
//! resumes on the next, so the transport may deliver bytes in arbitrary
//! chunks. Partial control-line bytes and partial payload bytes are buffered
//! separately.
//!
//! A parser instance is bound to one connection. On reconnect the connection
//! manager replaces the parser rather than resetting it, because framing
//! state cannot span connections.

use bytes::{Bytes, BytesMut};

use crate::{
    error::ParseError,
    frame::{Frame, MAX_CONTROL_LINE, ServerInfo},
    headers::HeaderMap,
};

/// Verbs the parser recognizes at the start of a control line.
const VERBS: [&str; 7] = ["MSG", "HMSG", "INFO", "PING", "PONG", "+OK", "-ERR"];

/// Message arguments captured from a `MSG`/`HMSG` control line while the
/// payload is still in flight.
#[derive(Debug)]
struct PendingMessage {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: usize,
    total_len: usize,
}

#[derive(Debug)]
enum State {
    /// Accumulating a CRLF-terminated control line.
    ControlLine,
    /// Accumulating `total_len` payload bytes.
    Payload,
    /// Expecting the CR of the payload's trailing CRLF.
    TrailerCr,
    /// Expecting the LF of the payload's trailing CRLF.
    TrailerLf,
}

/// Incremental byte-level state machine turning stream bytes into [`Frame`]s.
#[derive(Debug)]
pub struct Parser {
    state: State,
    line: Vec<u8>,
    saw_cr: bool,
    payload: BytesMut,
    pending: Option<PendingMessage>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Create a parser in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::ControlLine,
            line: Vec::new(),
            saw_cr: false,
            payload: BytesMut::new(),
            pending: None,
        }
    }

    /// Consume `input`, appending every completed frame to `out`.
    ///
    /// Never blocks and never discards partial state; the same byte stream
    /// fed in one call or split at every byte boundary yields the identical
    /// frame sequence.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] on any byte sequence that cannot belong to a
    /// valid frame. Parse errors are fatal to the connection; the parser must
    /// not be fed again afterwards.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<Frame>) -> Result<(), ParseError> {
        while !input.is_empty() {
            match self.state {
                State::ControlLine => input = self.take_control_bytes(input, out)?,
                State::Payload => input = self.take_payload_bytes(input),
                State::TrailerCr => {
                    if input[0] != b'\r' {
                        return Err(ParseError::MissingPayloadTerminator);
                    }
                    self.state = State::TrailerLf;
                    input = &input[1..];
                }
                State::TrailerLf => {
                    if input[0] != b'\n' {
                        return Err(ParseError::MissingPayloadTerminator);
                    }
                    input = &input[1..];
                    self.finish_message(out)?;
                }
            }
        }
        Ok(())
    }

    /// Accumulate control-line bytes until CRLF, dispatching the parsed line.
    fn take_control_bytes<'a>(
        &mut self,
        input: &'a [u8],
        out: &mut Vec<Frame>,
    ) -> Result<&'a [u8], ParseError> {
        for (i, &byte) in input.iter().enumerate() {
            if self.saw_cr {
                if byte != b'\n' {
                    return Err(ParseError::BadControlLine(lossy(&self.line)));
                }
                self.saw_cr = false;
                let line = std::mem::take(&mut self.line);
                self.dispatch_line(&line, out)?;
                return Ok(&input[i + 1..]);
            }
            if byte == b'\r' {
                self.saw_cr = true;
                continue;
            }
            if self.line.len() >= MAX_CONTROL_LINE {
                return Err(ParseError::ControlLineTooLong {
                    max: MAX_CONTROL_LINE,
                });
            }
            self.line.push(byte);
            self.check_verb_prefix()?;
        }
        Ok(&[])
    }

    /// Fail fast when the partial line can no longer match any known verb.
    fn check_verb_prefix(&self) -> Result<(), ParseError> {
        // Only the first few bytes decide the verb; later bytes are args.
        if self.line.len() > 5 {
            return Ok(());
        }
        let plausible = VERBS.iter().any(|verb| {
            let verb = verb.as_bytes();
            if self.line.len() <= verb.len() {
                verb[..self.line.len()].eq_ignore_ascii_case(&self.line)
            } else {
                verb.eq_ignore_ascii_case(&self.line[..verb.len()])
                    && self.line[verb.len()] == b' '
            }
        });
        if plausible {
            Ok(())
        } else {
            Err(ParseError::UnknownVerb(lossy(&self.line)))
        }
    }

    /// Parse one complete control line and either emit a frame or arm the
    /// payload collector.
    fn dispatch_line(&mut self, line: &[u8], out: &mut Vec<Frame>) -> Result<(), ParseError> {
        if line.is_empty() {
            return Err(ParseError::BadControlLine(String::new()));
        }
        let text = std::str::from_utf8(line)
            .map_err(|_| ParseError::BadControlLine(lossy(line)))?;
        let (verb, args) = match text.split_once(' ') {
            Some((verb, args)) => (verb, args),
            None => (text, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "+OK" => {
                expect_no_args(text, args)?;
                out.push(Frame::Ok);
            }
            "PING" => {
                expect_no_args(text, args)?;
                out.push(Frame::Ping);
            }
            "PONG" => {
                expect_no_args(text, args)?;
                out.push(Frame::Pong);
            }
            "-ERR" => {
                let message = args.trim().trim_matches('\'').to_owned();
                out.push(Frame::Err(message));
            }
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(args)
                    .map_err(|e| ParseError::BadInfo(e.to_string()))?;
                out.push(Frame::Info(info));
            }
            "MSG" => self.arm_message(text, args, false)?,
            "HMSG" => self.arm_message(text, args, true)?,
            _ => return Err(ParseError::UnknownVerb(text.to_owned())),
        }
        Ok(())
    }

    /// Parse `MSG`/`HMSG` arguments and transition to payload collection.
    fn arm_message(&mut self, line: &str, args: &str, with_headers: bool) -> Result<(), ParseError> {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        let fixed = if with_headers { 3 } else { 2 };
        let (reply, lengths) = match parts.len() {
            n if n == fixed + 1 => (None, &parts[2..]),
            n if n == fixed + 2 => (Some(parts[2].to_owned()), &parts[3..]),
            _ => return Err(ParseError::BadControlLine(line.to_owned())),
        };

        let subject = parts[0].to_owned();
        let sid: u64 = parts[1].parse().map_err(|_| ParseError::InvalidLength {
            field: "sid",
            value: parts[1].to_owned(),
        })?;

        let (header_len, total_len) = if with_headers {
            let header_len = parse_len("header length", lengths[0])?;
            let total_len = parse_len("total length", lengths[1])?;
            if header_len > total_len {
                return Err(ParseError::HeaderExceedsTotal {
                    header_len,
                    total_len,
                });
            }
            (header_len, total_len)
        } else {
            (0, parse_len("total length", lengths[0])?)
        };

        self.pending = Some(PendingMessage {
            subject,
            sid,
            reply,
            header_len,
            total_len,
        });
        self.payload.reserve(total_len);
        self.state = if total_len == 0 {
            State::TrailerCr
        } else {
            State::Payload
        };
        Ok(())
    }

    /// Copy payload bytes until `total_len` is satisfied.
    fn take_payload_bytes<'a>(&mut self, input: &'a [u8]) -> &'a [u8] {
        let total = self
            .pending
            .as_ref()
            .map_or(0, |pending| pending.total_len);
        let need = total - self.payload.len();
        let take = need.min(input.len());
        self.payload.extend_from_slice(&input[..take]);
        if self.payload.len() == total {
            self.state = State::TrailerCr;
        }
        &input[take..]
    }

    /// Emit the buffered message once payload and trailer are complete.
    fn finish_message(&mut self, out: &mut Vec<Frame>) -> Result<(), ParseError> {
        let pending = self
            .pending
            .take()
            .ok_or(ParseError::MissingPayloadTerminator)?;
        let body: Bytes = self.payload.split().freeze();
        debug_assert_eq!(body.len(), pending.total_len);

        let (headers, payload) = if pending.header_len > 0 {
            let headers = HeaderMap::decode(&body[..pending.header_len])?;
            (Some(headers), body.slice(pending.header_len..))
        } else {
            (None, body)
        };

        out.push(Frame::Message {
            subject: pending.subject,
            sid: pending.sid,
            reply: pending.reply,
            headers,
            payload,
        });
        self.state = State::ControlLine;
        Ok(())
    }
}

fn expect_no_args(line: &str, args: &str) -> Result<(), ParseError> {
    if args.trim().is_empty() {
        Ok(())
    } else {
        Err(ParseError::BadControlLine(line.to_owned()))
    }
}

fn parse_len(field: &'static str, value: &str) -> Result<usize, ParseError> {
    // `usize` parsing rejects negative and non-numeric tokens in one go.
    value.parse().map_err(|_| ParseError::InvalidLength {
        field,
        value: value.to_owned(),
    })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(input: &[u8]) -> Result<Vec<Frame>, ParseError> {
        let mut parser = Parser::new();
        let mut out = Vec::new();
        parser.feed(input, &mut out)?;
        Ok(out)
    }

    #[test]
    fn parses_control_frames() {
        let frames = feed_all(b"+OK\r\nPING\r\nPONG\r\n").unwrap();
        assert_eq!(frames, vec![Frame::Ok, Frame::Ping, Frame::Pong]);
    }

    #[test]
    fn verbs_are_case_insensitive() {
        let frames = feed_all(b"ping\r\nPoNg\r\n").unwrap();
        assert_eq!(frames, vec![Frame::Ping, Frame::Pong]);
    }

    #[test]
    fn parses_err_with_quotes() {
        let frames = feed_all(b"-ERR 'Authorization Violation'\r\n").unwrap();
        assert_eq!(frames, vec![Frame::Err("Authorization Violation".into())]);
    }

    #[test]
    fn parses_info_json() {
        let frames =
            feed_all(b"INFO {\"server_id\":\"s1\",\"max_payload\":1048576}\r\n").unwrap();
        match &frames[0] {
            Frame::Info(info) => {
                assert_eq!(info.server_id, "s1");
                assert_eq!(info.max_payload, 1_048_576);
            }
            other => panic!("expected INFO, got {other:?}"),
        }
    }

    #[test]
    fn parses_msg_with_payload() {
        let frames = feed_all(b"MSG foo 1 3\r\nbar\r\n").unwrap();
        assert_eq!(
            frames,
            vec![Frame::Message {
                subject: "foo".into(),
                sid: 1,
                reply: None,
                headers: None,
                payload: Bytes::from_static(b"bar"),
            }]
        );
    }

    #[test]
    fn parses_msg_with_reply_subject() {
        let frames = feed_all(b"MSG svc 7 _INBOX.a.b 2\r\nhi\r\n").unwrap();
        match &frames[0] {
            Frame::Message { reply, sid, .. } => {
                assert_eq!(reply.as_deref(), Some("_INBOX.a.b"));
                assert_eq!(*sid, 7);
            }
            other => panic!("expected MSG, got {other:?}"),
        }
    }

    #[test]
    fn parses_empty_payload() {
        let frames = feed_all(b"MSG foo 2 0\r\n\r\n").unwrap();
        match &frames[0] {
            Frame::Message { payload, .. } => assert!(payload.is_empty()),
            other => panic!("expected MSG, got {other:?}"),
        }
    }

    #[test]
    fn parses_hmsg_and_splits_headers() {
        let block = b"PROTO/1.0\r\nTrace: 1\r\n\r\n";
        let wire = format!(
            "HMSG foo 3 {} {}\r\n{}body\r\n",
            block.len(),
            block.len() + 4,
            String::from_utf8_lossy(block),
        );
        let frames = feed_all(wire.as_bytes()).unwrap();
        match &frames[0] {
            Frame::Message {
                headers, payload, ..
            } => {
                assert_eq!(headers.as_ref().unwrap().get("Trace"), Some("1"));
                assert_eq!(payload.as_ref(), b"body");
            }
            other => panic!("expected HMSG, got {other:?}"),
        }
    }

    #[test]
    fn header_only_message_has_empty_payload() {
        let block = b"PROTO/1.0 503\r\n\r\n";
        let wire = format!(
            "HMSG _INBOX.r 1 {len} {len}\r\n{block}\r\n",
            len = block.len(),
            block = String::from_utf8_lossy(block),
        );
        let frames = feed_all(wire.as_bytes()).unwrap();
        match &frames[0] {
            Frame::Message {
                headers, payload, ..
            } => {
                assert_eq!(headers.as_ref().unwrap().status(), Some(503));
                assert!(payload.is_empty());
            }
            other => panic!("expected HMSG, got {other:?}"),
        }
    }

    #[test]
    fn resumes_across_single_byte_feeds() {
        let wire = b"MSG foo 1 3\r\nbar\r\nPING\r\n";
        let mut parser = Parser::new();
        let mut out = Vec::new();
        for &byte in wire.iter() {
            parser.feed(&[byte], &mut out).unwrap();
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Frame::Ping);
    }

    #[test]
    fn rejects_unknown_verb_early() {
        let err = feed_all(b"QUUX foo\r\n").unwrap_err();
        assert!(matches!(err, ParseError::UnknownVerb(_)));
    }

    #[test]
    fn rejects_header_len_exceeding_total() {
        let err = feed_all(b"HMSG foo 1 10 4\r\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::HeaderExceedsTotal {
                header_len: 10,
                total_len: 4,
            }
        );
    }

    #[test]
    fn rejects_negative_length() {
        let err = feed_all(b"MSG foo 1 -3\r\n").unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidLength {
                field: "total length",
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_numeric_sid() {
        let err = feed_all(b"MSG foo abc 3\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidLength { field: "sid", .. }));
    }

    #[test]
    fn rejects_missing_payload_terminator() {
        let err = feed_all(b"MSG foo 1 3\r\nbarXY").unwrap_err();
        assert_eq!(err, ParseError::MissingPayloadTerminator);
    }

    #[test]
    fn rejects_overlong_control_line() {
        let mut wire = b"INFO ".to_vec();
        wire.extend(std::iter::repeat_n(b'x', MAX_CONTROL_LINE + 1));
        let err = feed_all(&wire).unwrap_err();
        assert!(matches!(err, ParseError::ControlLineTooLong { .. }));
    }

    #[test]
    fn payload_may_contain_crlf() {
        let frames = feed_all(b"MSG foo 1 6\r\na\r\nb\r\n\r\n").unwrap();
        match &frames[0] {
            Frame::Message { payload, .. } => assert_eq!(payload.as_ref(), b"a\r\nb\r\n"),
            other => panic!("expected MSG, got {other:?}"),
        }
    }
}
