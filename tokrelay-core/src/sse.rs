//! Server-Sent-Events framing.
//!
//! Encoding turns one payload into one self-delimiting frame. Decoding is incremental: raw
//! chunks go into a [`DecodeBuffer`] and complete payloads come out in arrival order, no matter
//! where the network happened to cut the bytes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{CoreResult, RelayError};
use crate::model::Fragment;

/// Application-level end-of-stream payload. Not JSON.
pub const DONE: &str = "[DONE]";

/// Comment text used for keep-alive frames.
pub const HEARTBEAT_TEXT: &str = "keep-alive";

/// Frame one fragment's raw text.
pub fn encode(fragment: &Fragment) -> Bytes {
    encode_payload(&fragment.text)
}

/// Frame a payload: each line gets its own `data:` prefix, then one blank line.
pub fn encode_payload(payload: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 16);
    for line in split_lines(payload) {
        if line.is_empty() {
            out.put_slice(b"data:\n");
        } else {
            out.put_slice(b"data: ");
            out.put_slice(line.as_bytes());
            out.put_u8(b'\n');
        }
    }
    out.put_u8(b'\n');
    out.freeze()
}

/// Frame a value as a single-line JSON payload.
pub fn encode_json<T: Serialize>(value: &T) -> CoreResult<Bytes> {
    let json = serde_json::to_string(value).map_err(|e| RelayError::Other(e.into()))?;
    Ok(encode_payload(&json))
}

/// `data: [DONE]\n\n`
pub fn encode_sentinel() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// `: keep-alive\n\n`
pub fn encode_heartbeat() -> Bytes {
    encode_comment(HEARTBEAT_TEXT)
}

/// A comment frame. Newlines in `text` are flattened so the frame stays a single comment.
pub fn encode_comment(text: &str) -> Bytes {
    let flat = text.replace(['\r', '\n'], " ");
    Bytes::from(format!(": {flat}\n\n"))
}

/// Split on `\r\n`, `\r` or `\n`. Always yields at least one (possibly empty) line.
fn split_lines(s: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&s[start..i]);
                start = i + 1;
            }
            b'\r' => {
                lines.push(&s[start..i]);
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    lines.push(&s[start..]);
    lines
}

/// Bytes received but not yet resolved into a complete frame.
///
/// Line endings are normalised to `\n` on the way in; a `\r\n` pair split across two chunks
/// still collapses to one newline. Never holds a complete frame between calls to [`feed`].
///
/// [`feed`]: DecodeBuffer::feed
#[derive(Debug, Default)]
pub struct DecodeBuffer {
    bytes: Vec<u8>,
    last_was_cr: bool,
    /// Prefix of `bytes` already known to hold no boundary.
    scanned: usize,
}

impl DecodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every payload it completes, oldest first.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.reserve(chunk.len());
        for &b in chunk {
            match b {
                b'\r' => {
                    self.bytes.push(b'\n');
                    self.last_was_cr = true;
                }
                b'\n' if self.last_was_cr => self.last_was_cr = false,
                _ => {
                    self.bytes.push(b);
                    self.last_was_cr = false;
                }
            }
        }

        let mut frames = Vec::new();
        let mut start = 0;
        // Back up one byte: a boundary may straddle the old tail and the new chunk.
        let mut from = self.scanned.saturating_sub(1);
        while let Some(pos) = find_boundary(&self.bytes[from..]) {
            let end = from + pos;
            if let Some(payload) = decode_segment(&self.bytes[start..end]) {
                frames.push(payload);
            }
            start = end + 2;
            from = start;
        }
        if start > 0 {
            self.bytes.drain(..start);
        }
        self.scanned = self.bytes.len();
        frames
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Discard the buffer at end of stream, returning whatever incomplete text was left.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Extract the payload of one complete segment, or `None` for comments and data-less blocks.
fn decode_segment(segment: &[u8]) -> Option<String> {
    if segment.is_empty() || segment[0] == b':' {
        return None;
    }
    let text = String::from_utf8_lossy(segment);
    let mut data: Option<String> = None;
    for line in text.split('\n') {
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let value = rest.strip_prefix(' ').unwrap_or(rest);
        match data.as_mut() {
            Some(acc) => {
                acc.push('\n');
                acc.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}
