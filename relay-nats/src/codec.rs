//! Text protocol codec.
//!
//! Sans-IO: the decoder is fed raw socket bytes and yields typed server
//! operations; the encoder appends client commands to a write buffer.
//!
//! Framing: control lines end in CRLF (a bare LF is tolerated). `MSG` and
//! `HMSG` are followed by a length-prefixed payload and a CRLF. Operation
//! names are case-insensitive.

use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use thiserror::Error;

use relay_core::error::ClientError;

use crate::info::{ConnectInfo, ServerInfo};
use crate::message::{Message, Sid};

/// Longest control line accepted before the stream is declared corrupt.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Payload cap until the server announces its own `max_payload`.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("control line exceeds maximum length")]
    LineTooLong,

    #[error("unknown protocol operation: {0:?}")]
    UnknownOp(String),

    #[error("malformed {op}: {line:?}")]
    Malformed { op: &'static str, line: String },

    #[error("message of {size} bytes exceeds max payload {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid INFO payload: {0}")]
    InvalidInfo(String),

    #[error("failed to encode CONNECT: {0}")]
    Encode(String),
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// A decoded server operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg(Message),
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Stateful protocol decoder
///
/// Bytes are accumulated until a full operation (control line plus payload,
/// if any) is present. Incomplete input leaves the buffer untouched.
#[derive(Debug)]
pub struct ProtoDecoder {
    buf: BytesMut,
    max_payload: usize,
}

impl Default for ProtoDecoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ProtoDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject messages larger than `limit`; zero keeps the current cap.
    pub fn set_max_payload(&mut self, limit: usize) {
        if limit > 0 {
            self.max_payload = limit;
        }
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode a single operation.
    ///
    /// Returns:
    /// - Ok(Some(op)) → operation decoded and consumed
    /// - Ok(None) → need more data
    /// - Err → protocol violation; the stream cannot be resynchronized
    pub fn decode(&mut self) -> Result<Option<ServerOp>> {
        let Some(nl) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_CONTROL_LINE {
                return Err(CodecError::LineTooLong);
            }
            return Ok(None);
        };
        if nl > MAX_CONTROL_LINE {
            return Err(CodecError::LineTooLong);
        }

        let line_end = if nl > 0 && self.buf[nl - 1] == b'\r' { nl - 1 } else { nl };
        let line = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
        let (op, rest) = match line.find(|c: char| c == ' ' || c == '\t') {
            Some(i) => (&line[..i], line[i..].trim()),
            None => (line.as_str(), ""),
        };

        let decoded = match op.to_ascii_uppercase().as_str() {
            "MSG" => return self.decode_msg(&line, rest, nl + 1, false),
            "HMSG" => return self.decode_msg(&line, rest, nl + 1, true),
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(rest.trim_matches('\'').to_string()),
            "INFO" => {
                let info: ServerInfo = serde_json::from_str(rest)
                    .map_err(|e| CodecError::InvalidInfo(e.to_string()))?;
                ServerOp::Info(Box::new(info))
            }
            "" => {
                // Stray blank line between operations.
                self.buf.advance(nl + 1);
                return self.decode();
            }
            _ => return Err(CodecError::UnknownOp(op.to_string())),
        };

        self.buf.advance(nl + 1);
        Ok(Some(decoded))
    }

    /// `MSG <subject> <sid> [reply] <#bytes>` or
    /// `HMSG <subject> <sid> [reply] <#hdr> <#total>`.
    fn decode_msg(
        &mut self,
        line: &str,
        args: &str,
        header_len: usize,
        with_headers: bool,
    ) -> Result<Option<ServerOp>> {
        let op = if with_headers { "HMSG" } else { "MSG" };
        let malformed = || CodecError::Malformed {
            op,
            line: line.to_string(),
        };

        let tokens: SmallVec<[&str; 5]> = args.split_ascii_whitespace().collect();
        let size_count = if with_headers { 2 } else { 1 };
        let (subject, sid, reply, sizes) = match tokens.len().saturating_sub(size_count) {
            2 => (tokens[0], tokens[1], None, &tokens[2..]),
            3 => (tokens[0], tokens[1], Some(tokens[2]), &tokens[3..]),
            _ => return Err(malformed()),
        };

        let sid: Sid = sid.parse().map_err(|_| malformed())?;
        let numbers: SmallVec<[usize; 2]> = sizes
            .iter()
            .map(|s| s.parse::<usize>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| malformed())?;
        let (hdr_len, total_len) = if with_headers {
            (numbers[0], numbers[1])
        } else {
            (0, numbers[0])
        };
        if hdr_len > total_len {
            return Err(malformed());
        }
        if total_len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                size: total_len,
                limit: self.max_payload,
            });
        }

        let frame_len = header_len
            .checked_add(total_len)
            .and_then(|n| n.checked_add(CRLF.len()))
            .ok_or_else(malformed)?;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        if &self.buf[header_len + total_len..frame_len] != CRLF {
            return Err(malformed());
        }

        let subject = subject.to_string();
        let reply = reply.map(str::to_string);

        self.buf.advance(header_len);
        let mut body = self.buf.split_to(total_len).freeze();
        self.buf.advance(CRLF.len());

        let mut msg = Message::new(subject, sid, Bytes::new());
        msg.reply = reply;
        if with_headers {
            let headers = body.split_to(hdr_len);
            msg.status = parse_status(&headers);
            msg.headers = Some(headers);
        }
        msg.payload = body;
        Ok(Some(ServerOp::Msg(msg)))
    }
}

/// Status code from a `NATS/1.0 <code> [description]` header line.
fn parse_status(headers: &[u8]) -> Option<u16> {
    let first = headers.split(|b| *b == b'\n').next()?;
    let first = std::str::from_utf8(first).ok()?.trim();
    let mut parts = first.split_ascii_whitespace();
    if !parts.next()?.starts_with("NATS/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// A client command to encode
#[derive(Debug, Clone, Copy)]
pub enum ClientOp<'a> {
    Connect(&'a ConnectInfo),
    Pub {
        subject: &'a str,
        reply: Option<&'a str>,
        payload: &'a [u8],
    },
    Sub {
        subject: &'a str,
        queue_group: Option<&'a str>,
        sid: Sid,
    },
    Unsub {
        sid: Sid,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp<'_> {
    /// Append the wire form of this command to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Connect(info) => {
                dst.put_slice(b"CONNECT ");
                serde_json::to_writer((&mut *dst).writer(), info)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
            }
            Self::Pub {
                subject,
                reply,
                payload,
            } => {
                match reply {
                    Some(reply) => put_fmt(dst, format_args!("PUB {subject} {reply} {}\r\n", payload.len())),
                    None => put_fmt(dst, format_args!("PUB {subject} {}\r\n", payload.len())),
                }
                dst.put_slice(payload);
            }
            Self::Sub {
                subject,
                queue_group,
                sid,
            } => match queue_group {
                Some(queue) => put_fmt(dst, format_args!("SUB {subject} {queue} {sid}")),
                None => put_fmt(dst, format_args!("SUB {subject} {sid}")),
            },
            Self::Unsub { sid, max } => match max {
                Some(max) => put_fmt(dst, format_args!("UNSUB {sid} {max}")),
                None => put_fmt(dst, format_args!("UNSUB {sid}")),
            },
            Self::Ping => dst.put_slice(b"PING"),
            Self::Pong => dst.put_slice(b"PONG"),
        }
        dst.put_slice(CRLF);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }
}

fn put_fmt(dst: &mut BytesMut, args: std::fmt::Arguments<'_>) {
    // BytesMut grows on demand; formatting into it cannot fail.
    let _ = dst.write_fmt(args);
}
