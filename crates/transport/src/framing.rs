//! The `Content-Length` frame codec.
//!
//! Frames are `Content-Length: N\r\n\r\n<body>` with exactly `N` body bytes.
//! Header names are case-insensitive and values may carry leading whitespace;
//! headers other than `Content-Length` are ignored. The extractor tolerates
//! `\n`-only line endings on input; [`encode`] always emits CRLF.

use thiserror::Error;

/// Hard cap on a single frame body.
pub const MAX_CONTENT_LENGTH: usize = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("Content-Length {0} exceeds maximum frame size {MAX_CONTENT_LENGTH}")]
    BodyTooLarge(u64),
}

/// Outcome of one [`extract`] pass over the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Extracted {
    /// The buffer does not yet hold a complete frame; nothing was consumed.
    NeedMore,
    /// One complete frame; header and body were consumed from the buffer.
    Frame(Vec<u8>),
    /// The header region was invalid and has been skipped; framing resumes
    /// at the byte after the blank line.
    Malformed(FrameError),
}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Index one past the blank line terminating the header region, if present.
/// Lines may end in `\r\n` or bare `\n`.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(rel) = buf[pos..].iter().position(|&b| b == b'\n') {
        let line = &buf[pos..pos + rel];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Some(pos + rel + 1);
        }
        pos += rel + 1;
    }
    None
}

fn trim_leading_ws(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    value
}

/// Scan the header region for the effective `Content-Length`.
///
/// Among parseable in-range values the last one wins. `oversize` reports the
/// last parseable value above [`MAX_CONTENT_LENGTH`] so the caller can tell
/// a too-large body from a missing header.
fn parse_headers(region: &[u8]) -> (Option<usize>, Option<u64>) {
    let mut content_length = None;
    let mut oversize = None;
    for raw_line in region.split(|&b| b == b'\n') {
        let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !line[..colon].eq_ignore_ascii_case(b"content-length") {
            continue;
        }
        let value = trim_leading_ws(&line[colon + 1..]);
        let Some(n) = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        if n <= MAX_CONTENT_LENGTH as u64 {
            content_length = Some(n as usize);
        } else {
            oversize = Some(n);
        }
    }
    (content_length, oversize)
}

/// Extract the next frame from `buf`.
///
/// Repeated application on a growing buffer yields the exact payload stream
/// originally encoded, in order, for any chunking of the input bytes.
pub fn extract(buf: &mut Vec<u8>) -> Extracted {
    let Some(header_end) = find_header_end(buf) else {
        return Extracted::NeedMore;
    };

    let (content_length, oversize) = parse_headers(&buf[..header_end]);
    let Some(len) = content_length else {
        // Skip the bad header region so the stream can continue.
        buf.drain(..header_end);
        let err = match oversize {
            Some(n) => FrameError::BodyTooLarge(n),
            None => FrameError::MissingContentLength,
        };
        return Extracted::Malformed(err);
    };

    if buf.len() < header_end + len {
        return Extracted::NeedMore;
    }

    let body = buf[header_end..header_end + len].to_vec();
    buf.drain(..header_end + len);
    Extracted::Frame(body)
}
