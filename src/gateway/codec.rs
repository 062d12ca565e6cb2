//! Newline-delimited JSON framing over a byte stream.
//!
//! One JSON value per `\n`-terminated line. Framing never depends on the
//! content of a line, so a malformed line costs exactly that line: the
//! decoder reports it and resumes at the next newline.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::errors::GatewayError;

/// Default maximum size of one buffered line (10 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Read chunk size for [`FrameReader`].
const READ_CHUNK: usize = 8 * 1024;

/// How much of a malformed line to keep in the error message.
const PREVIEW_CHARS: usize = 120;

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Serialize a message as one frame: compact JSON followed by `\n`.
///
/// `serde_json` escapes control characters inside strings, so the encoded
/// body never contains a raw newline.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, GatewayError> {
    let mut bytes = serde_json::to_vec(msg).map_err(|e| GatewayError::ProtocolError {
        reason: format!("failed to serialize frame: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Incremental line decoder. Feed it arbitrary chunks; it yields one item per
/// complete non-blank line.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Set after an oversized line was reported; bytes are dropped until the
    /// next newline.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Consume a chunk of bytes, returning every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<serde_json::Value, GatewayError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let line = &rest[..pos];
                    rest = &rest[pos + 1..];

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if self.buf.len() + line.len() > self.max_line_bytes {
                        self.buf.clear();
                        out.push(Err(self.oversized()));
                        continue;
                    }
                    self.buf.extend_from_slice(line);
                    let line = std::mem::take(&mut self.buf);
                    if let Some(frame) = parse_line(&line) {
                        out.push(frame);
                    }
                }
                None => {
                    if !self.discarding {
                        if self.buf.len() + rest.len() > self.max_line_bytes {
                            self.buf.clear();
                            self.discarding = true;
                            out.push(Err(self.oversized()));
                        } else {
                            self.buf.extend_from_slice(rest);
                        }
                    }
                    rest = &[];
                }
            }
        }

        out
    }

    /// Flush an unterminated trailing line at end of stream.
    pub fn finish(&mut self) -> Option<Result<serde_json::Value, GatewayError>> {
        self.discarding = false;
        let line = std::mem::take(&mut self.buf);
        parse_line(&line)
    }

    /// Bytes currently buffered for an incomplete line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn oversized(&self) -> GatewayError {
        GatewayError::ProtocolError {
            reason: format!("line exceeds {} bytes", self.max_line_bytes),
        }
    }
}

/// Parse one line; blank lines yield nothing.
fn parse_line(line: &[u8]) -> Option<Result<serde_json::Value, GatewayError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Some(Err(GatewayError::ProtocolError {
                reason: format!("line is not valid UTF-8: {e}"),
            }))
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(
        serde_json::from_str(trimmed).map_err(|e| GatewayError::ProtocolError {
            reason: format!("malformed JSON ({e}): {}", preview(trimmed)),
        }),
    )
}

fn preview(line: &str) -> String {
    if line.chars().count() <= PREVIEW_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}

// ─── Async Reader / Writer ───────────────────────────────────────────────────

/// One event from a [`FrameReader`].
#[derive(Debug)]
pub enum ReadEvent {
    /// A complete, well-formed JSON value.
    Frame(serde_json::Value),
    /// A line was dropped; the stream continues.
    Malformed(GatewayError),
    /// The peer closed the stream.
    Eof,
}

/// Pulls frames off an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    ready: VecDeque<Result<serde_json::Value, GatewayError>>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_line_bytes),
            ready: VecDeque::new(),
            eof: false,
        }
    }

    /// Wait for the next event. I/O errors are returned as-is and end the
    /// stream from the caller's point of view.
    pub async fn next_event(&mut self) -> std::io::Result<ReadEvent> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Ok(match item {
                    Ok(value) => ReadEvent::Frame(value),
                    Err(e) => ReadEvent::Malformed(e),
                });
            }
            if self.eof {
                return Ok(ReadEvent::Eof);
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                if let Some(item) = self.decoder.finish() {
                    self.ready.push_back(item);
                }
                continue;
            }
            self.ready.extend(self.decoder.push(&chunk[..n]));
        }
    }
}

/// Writes whole frames. Callers that share a stream wrap this in a mutex so
/// frames never interleave.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode, write and flush one message.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> std::io::Result<()> {
        let bytes = encode_frame(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await
    }

    /// Flush and close the underlying stream.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
