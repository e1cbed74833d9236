//! Text event stream frames and the client-side decoder.
//!
//! The server writes frames through axum's `Sse` response. Each change is
//! `event: <name>\ndata: <json>\n\n`, and an idle stream carries the
//! comment frame `:heartbeat`. The decoder accepts chunks split at
//! arbitrary byte boundaries, as delivered by an HTTP body.

use serde::Serialize;

use super::HEARTBEAT_COMMENT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event { name: String, data: String },
    Comment(String),
}

impl Frame {
    pub fn event(name: impl Into<String>, data: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Frame::Event {
            name: name.into(),
            data: serde_json::to_string(data)?,
        })
    }

    pub fn heartbeat() -> Self {
        Frame::Comment(HEARTBEAT_COMMENT.to_string())
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Comment(text) if text == HEARTBEAT_COMMENT)
    }
}

/// Incremental decoder for a text event stream.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, separator)) = find_block_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + separator).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn find_block_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|i| (i, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_block(block: &str) -> Option<Frame> {
    let mut name: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();
    let mut comment: Option<String> = None;

    for line in block.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(':') {
            comment.get_or_insert_with(|| rest.trim_start().to_string());
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => name = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if name.is_some() || !data.is_empty() {
        Some(Frame::Event {
            name: name.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    } else {
        comment.map(Frame::Comment)
    }
}
