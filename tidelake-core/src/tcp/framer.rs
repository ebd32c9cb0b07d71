//! Per-protocol inbound framers: byte-stream state machines that turn raw
//! reads into discrete frames.
//!
//! Grounded on spec.md §4.3's abstract framer contract and, for the shape of
//! "a small sum type behind one dispatch point instead of a trait-object
//! hierarchy", on design note §9 ("Polymorphic connection hierarchy...
//! express as a sum of concrete framer types"). The three variants below are
//! hand-rolled because no length-delimited codec or websocket crate sits in
//! the teacher's dependency graph (`monolake-services` builds its own HTTP/1
//! and h2 codecs the same way rather than reaching for `tokio-util`).

use base64::Engine;
use bytes::{Bytes, BytesMut};

/// Maximum length-prefixed frame size accepted by the default protocol
/// before the connection is treated as speaking garbage and closed.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Malformed input a framer can't make sense of. Always maps to closing the
/// connection and delivering a system message describing the cause
/// (spec.md §7's "protocol" taxonomy entry).
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("missing Sec-WebSocket-Key")]
    MissingHandshakeKey,
    #[error("unsupported websocket opcode {0}")]
    UnsupportedOpcode(u8),
}

/// What a `read()` request against the custom protocol is waiting for.
#[derive(Debug, Clone, Copy)]
pub enum ReadKind {
    /// Exactly `n` bytes.
    Count(usize),
    /// Up to and including the first occurrence of this byte.
    Delimiter(u8),
}

/// An outstanding `read()` request against a custom-protocol connection.
/// At most one may be pending per connection (spec.md §4.3).
#[derive(Debug, Clone, Copy)]
pub struct PendingRead {
    pub kind: ReadKind,
    pub respid: i32,
}

/// Length-prefixed binary framer: a 4-byte big-endian length prefix
/// followed by that many payload bytes, repeated. This is the "default"
/// protocol and frames eagerly — every complete frame in the buffer is
/// emitted without the owning service asking for it.
#[derive(Default)]
pub struct LengthPrefixedFramer {
    buf: BytesMut,
}

impl LengthPrefixedFramer {
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(self.buf[..4].try_into().unwrap()) as usize;
            if len > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge { len, max: MAX_FRAME_LEN });
            }
            if self.buf.len() < 4 + len {
                break;
            }
            self.buf.advance_front(4);
            frames.push(self.buf.split_to(len).freeze());
        }
        Ok(frames)
    }
}

/// Small helper so both framers below can drop a prefix without importing
/// `bytes::Buf` at every call site.
trait AdvanceFront {
    fn advance_front(&mut self, n: usize);
}

impl AdvanceFront for BytesMut {
    fn advance_front(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}

/// Custom protocol: no implicit framing at all. The owning service must
/// call `read(connid, n, delim, respid)` explicitly for every frame it
/// wants; this framer just accumulates bytes and answers `try_take` once
/// enough data (or a delimiter) is present.
#[derive(Default)]
pub struct DelimitedFramer {
    buf: BytesMut,
}

impl DelimitedFramer {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to satisfy `req` against currently buffered bytes, consuming
    /// the matched prefix on success. Leaves the buffer untouched if the
    /// request can't yet be satisfied.
    pub fn try_take(&mut self, req: ReadKind) -> Option<Bytes> {
        match req {
            ReadKind::Count(n) => {
                if self.buf.len() >= n {
                    Some(self.buf.split_to(n).freeze())
                } else {
                    None
                }
            }
            ReadKind::Delimiter(delim) => {
                let pos = self.buf.iter().position(|&b| b == delim)?;
                Some(self.buf.split_to(pos + 1).freeze())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsHandshakeState {
    Handshaking,
    Ready,
}

/// A subset of RFC 6455 sufficient for spec.md's requirements: server-side
/// handshake, and text/binary/close data frames. Ping/pong are
/// acknowledged implicitly (frame is consumed, no application frame is
/// produced); full extension/fragmentation support is out of scope, per
/// spec.md §1's exclusion of "HTTP/WebSocket handshake byte-exact
/// behavior".
pub struct WebSocketFramer {
    buf: BytesMut,
    state: WsHandshakeState,
}

impl Default for WebSocketFramer {
    fn default() -> Self {
        WebSocketFramer { buf: BytesMut::new(), state: WsHandshakeState::Handshaking }
    }
}

/// Result of feeding bytes into a [`WebSocketFramer`].
pub struct WsFeed {
    /// `(is_binary, payload)` for every complete data frame extracted.
    pub frames: Vec<(bool, Bytes)>,
    /// The handshake response to write back, if the handshake just
    /// completed on this call.
    pub handshake_response: Option<Bytes>,
    /// The peer sent a close frame; the connection should be torn down
    /// after flushing any already-queued writes.
    pub closed: bool,
}

enum WsFrame {
    Data { binary: bool, payload: Bytes },
    Control,
    Close,
}

impl WebSocketFramer {
    pub fn feed(&mut self, bytes: &[u8]) -> Result<WsFeed, ProtocolError> {
        self.buf.extend_from_slice(bytes);

        let mut handshake_response = None;
        if self.state == WsHandshakeState::Handshaking {
            match self.try_complete_handshake()? {
                Some(resp) => {
                    handshake_response = Some(resp);
                    self.state = WsHandshakeState::Ready;
                }
                None => return Ok(WsFeed { frames: Vec::new(), handshake_response: None, closed: false }),
            }
        }

        let mut frames = Vec::new();
        let mut closed = false;
        loop {
            match self.try_parse_frame()? {
                None => break,
                Some(WsFrame::Data { binary, payload }) => frames.push((binary, payload)),
                Some(WsFrame::Control) => continue,
                Some(WsFrame::Close) => {
                    closed = true;
                    break;
                }
            }
        }
        Ok(WsFeed { frames, handshake_response, closed })
    }

    fn try_complete_handshake(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let Some(end) = find_subslice(&self.buf, b"\r\n\r\n") else {
            return Ok(None);
        };
        let header = self.buf.split_to(end + 4);
        let key = extract_header_value(&header, b"Sec-WebSocket-Key:").ok_or(ProtocolError::MissingHandshakeKey)?;
        let accept = websocket_accept_value(&key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        Ok(Some(Bytes::from(response)))
    }

    fn try_parse_frame(&mut self) -> Result<Option<WsFrame>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];
        let opcode = b0 & 0x0F;
        let masked = (b1 & 0x80) != 0;
        let mut len = (b1 & 0x7F) as usize;
        let mut offset = 2;

        if len == 126 {
            if self.buf.len() < offset + 2 {
                return Ok(None);
            }
            len = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]) as usize;
            offset += 2;
        } else if len == 127 {
            if self.buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&self.buf[offset..offset + 8]);
            len = u64::from_be_bytes(raw) as usize;
            offset += 8;
        }

        let mask_len = if masked { 4 } else { 0 };
        if self.buf.len() < offset + mask_len + len {
            return Ok(None);
        }

        let mask = masked.then(|| {
            let m = [self.buf[offset], self.buf[offset + 1], self.buf[offset + 2], self.buf[offset + 3]];
            offset += 4;
            m
        });

        let mut payload = self.buf[offset..offset + len].to_vec();
        if let Some(mask) = mask {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= mask[i % 4];
            }
        }
        let total = offset + len;
        self.buf.split_to(total);

        match opcode {
            0x1 => Ok(Some(WsFrame::Data { binary: false, payload: Bytes::from(payload) })),
            0x2 => Ok(Some(WsFrame::Data { binary: true, payload: Bytes::from(payload) })),
            0x8 => Ok(Some(WsFrame::Close)),
            0x0 | 0x9 | 0xA => Ok(Some(WsFrame::Control)),
            other => Err(ProtocolError::UnsupportedOpcode(other)),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn extract_header_value(header_block: &[u8], name: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(header_block).ok()?;
    for line in text.split("\r\n") {
        let bytes = line.as_bytes();
        if bytes.len() > name.len() && bytes[..name.len()].eq_ignore_ascii_case(name) {
            return Some(line[name.len()..].trim().to_string());
        }
    }
    None
}

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn websocket_accept_value(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key);
    input.push_str(WS_GUID);
    let digest = sha1_smol::Sha1::from(input.as_bytes()).digest().bytes();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_emits_exactly_complete_frames() {
        let mut framer = LengthPrefixedFramer::default();
        let frames = framer.feed(&[0, 0, 0, 4, 1, 2, 3, 4, 0, 0, 0, 2]).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[1, 2, 3, 4])]);
        let frames = framer.feed(&[9, 9]).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[9, 9])]);
    }

    #[test]
    fn length_prefixed_rejects_oversized_frame() {
        let mut framer = LengthPrefixedFramer::default();
        let huge = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        assert!(framer.feed(&huge).is_err());
    }

    #[test]
    fn delimited_waits_until_satisfied() {
        let mut framer = DelimitedFramer::default();
        framer.feed(b"hel");
        assert!(framer.try_take(ReadKind::Count(5)).is_none());
        framer.feed(b"lo");
        assert_eq!(framer.try_take(ReadKind::Count(5)).unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn delimited_by_byte() {
        let mut framer = DelimitedFramer::default();
        framer.feed(b"abc\ndef");
        let line = framer.try_take(ReadKind::Delimiter(b'\n')).unwrap();
        assert_eq!(line, Bytes::from_static(b"abc\n"));
    }

    #[test]
    fn websocket_accept_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
