//! Incremental `text/event-stream` frame decoder.
//!
//! Frames arrive as arbitrary byte chunks; a frame is a group of `field:`
//! lines terminated by a blank line. Decode errors are recoverable: a bad
//! frame is reported and skipped while the stream stays alive.

use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// One server-sent event: the `event` name, the optional `id` (the stream
/// cursor), and the joined `data` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.id.is_none() && self.data.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub frames: Vec<SseFrame>,
    pub errors: Vec<FrameError>,
}

impl Default for DecodeReport {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    current: SseFrame,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            current: SseFrame::default(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if line.ends_with(b"\n") {
                line.pop();
            }
            if line.ends_with(b"\r") {
                line.pop();
            }

            if line.is_empty() {
                self.flush_current(&mut report);
                continue;
            }

            if line.len() > self.max_frame_bytes {
                report.errors.push(FrameError::OversizedFrame {
                    size: line.len(),
                    max: self.max_frame_bytes,
                });
                self.current = SseFrame::default();
                continue;
            }

            self.consume_line(&line, &mut report);
        }

        if !self.pending.is_empty() && self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Flush a trailing frame that was not blank-line terminated before the
    /// connection closed.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_line(&line, &mut report);
        }
        self.flush_current(&mut report);
        report
    }

    fn flush_current(&mut self, report: &mut DecodeReport) {
        let frame = std::mem::take(&mut self.current);
        if !frame.is_empty() {
            report.frames.push(frame);
        }
    }

    fn consume_line(&mut self, line: &[u8], report: &mut DecodeReport) {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(err) => {
                report.errors.push(FrameError::Decode(err.to_string()));
                return;
            }
        };

        // Comment lines keep the connection warm, nothing else.
        if text.starts_with(':') {
            return;
        }

        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text, ""),
        };

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            // `retry` and unknown fields are ignored per the SSE contract.
            _ => {}
        }
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
