//! Incremental Server-Sent Events decoding.
//!
//! Chunks from the HTTP body do not line up with SSE messages, so the decoder
//! keeps the unfinished line between calls. Only `data` fields matter here;
//! comments (keep-alives) and other fields are skipped.

use pulse_core::defaults::CLIENT_MAX_FRAME_BYTES;
use pulse_core::{Error, Result};

/// Stateful decoder turning body chunks into message payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    line: Vec<u8>,
    data: Vec<String>,
    /// Bytes held in `line` and `data` together.
    buffered: usize,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(CLIENT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that gives up once one message exceeds `max_frame_bytes`.
    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            line: Vec::new(),
            data: Vec::new(),
            buffered: 0,
            max_frame_bytes,
        }
    }

    /// Feed a chunk and return every message it completed.
    ///
    /// Multi-line `data` fields are joined with `\n`. Messages without any
    /// `data` field (keep-alive comments) produce nothing.
    ///
    /// Fails with `Transport` once a single message outgrows the limit; the
    /// decoder is unusable afterwards and the connection should be dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                self.buffered += 1;
                if self.buffered > self.max_frame_bytes {
                    return Err(Error::Transport(format!(
                        "SSE message exceeds {} bytes",
                        self.max_frame_bytes
                    )));
                }
                continue;
            }
            let raw_len = self.line.len();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = std::mem::take(&mut self.line);
            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(std::mem::take(&mut self.data).join("\n"));
                }
                self.buffered = 0;
                continue;
            }
            if !self.field(&String::from_utf8_lossy(&line)) {
                self.buffered -= raw_len;
            }
        }
        Ok(frames)
    }

    /// Whether a partial line or message is buffered.
    pub fn is_pending(&self) -> bool {
        !self.line.is_empty() || !self.data.is_empty()
    }

    /// Apply one field line. Returns whether it was kept as data.
    fn field(&mut self, line: &str) -> bool {
        if line.starts_with(':') {
            return false;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if name != "data" {
            return false;
        }
        self.data.push(value.to_string());
        true
    }
}
