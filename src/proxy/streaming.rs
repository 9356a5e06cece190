//! Server-sent-event relay for streamed completions
//!
//! Upstream bytes are cut into whole SSE frames (at most one partial frame is
//! buffered, bounded by [`sse::MAX_FRAME_BYTES`]) and re-emitted unmodified.
//! Model, fingerprint and usage are picked from whichever frame carries them.
//! The upstream `[DONE]` is swallowed; once the upstream ends the completion
//! hook runs and then exactly one terminator frame is sent.

use crate::providers::constants::{json_fields, sse};
use crate::providers::{ProviderError, ResponseMetadata};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Frames buffered between the upstream reader and the client
const RELAY_BUFFER: usize = 32;

pub type RelayBody = BoxStream<'static, Result<Bytes, io::Error>>;

/// Runs once per stream, before the terminator frame is sent
pub type CompletionHook = Box<dyn FnOnce(&StreamSummary) + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("SSE frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Cuts a byte stream into complete SSE frames
#[derive(Debug)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn frame_end(buffer: &[u8]) -> Option<usize> {
    let lf = find(buffer, b"\n\n").map(|at| at + 2);
    let crlf = find(buffer, b"\r\n\r\n").map(|at| at + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Feed a chunk; returns every frame it completed, separators included
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, StreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end).collect();
            frames.push(Bytes::from(frame));
        }
        if self.buffer.len() > self.max_frame_bytes {
            return Err(StreamError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }
        Ok(frames)
    }

    /// Whatever trailing bytes the upstream left without a separator
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(Bytes::from(rest))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Done,
    Data(String),
    /// Comments, keep-alives and event-only frames
    Other,
}

pub fn classify_frame(frame: &[u8]) -> SseFrame {
    let text = String::from_utf8_lossy(frame);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix(sse::DATA_PREFIX))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() {
        return SseFrame::Other;
    }
    let joined = data.join("\n");
    if joined.trim() == sse::DONE {
        SseFrame::Done
    } else {
        SseFrame::Data(joined)
    }
}

fn carries_content(chunk: &Value) -> bool {
    chunk
        .get(json_fields::CHOICES)
        .and_then(Value::as_array)
        .is_some_and(|choices| {
            choices.iter().any(|choice| {
                choice
                    .get(json_fields::DELTA)
                    .and_then(|delta| delta.get(json_fields::CONTENT))
                    .and_then(Value::as_str)
                    .is_some_and(|content| !content.is_empty())
            })
        })
}

/// What the relay saw by the time the stream ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub metadata: ResponseMetadata,
    /// Chunks with non-empty delta content
    pub content_chunks: u64,
    pub frames: u64,
    /// The upstream ended normally
    pub completed: bool,
    pub client_disconnected: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

impl StreamSummary {
    fn observe(&mut self, data: &str) {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.metadata.merge(ResponseMetadata::from_json(&chunk));
        if carries_content(&chunk) {
            self.content_chunks += 1;
        }
    }

    /// Reported usage, else one token per content-bearing chunk
    pub fn tokens_out(&self) -> u64 {
        self.metadata
            .completion_tokens
            .unwrap_or(self.content_chunks)
    }
}

/// Relay `upstream` to the client through a bounded channel.
///
/// The reader task stops as soon as the client side is dropped.
pub fn relay(
    upstream: BoxStream<'static, Result<Bytes, ProviderError>>,
    on_complete: CompletionHook,
) -> RelayBody {
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    tokio::spawn(pump(upstream, tx, on_complete));
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

async fn forward(
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    summary: &mut StreamSummary,
    frame: Bytes,
) -> bool {
    match classify_frame(&frame) {
        SseFrame::Done => return true,
        SseFrame::Data(data) => {
            summary.frames += 1;
            summary.observe(&data);
        }
        SseFrame::Other => {}
    }
    tx.send(Ok(frame)).await.is_ok()
}

async fn pump(
    mut upstream: BoxStream<'static, Result<Bytes, ProviderError>>,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    on_complete: CompletionHook,
) {
    let started = Instant::now();
    let mut decoder = SseFrameDecoder::new(sse::MAX_FRAME_BYTES);
    let mut summary = StreamSummary::default();

    'relay: loop {
        let next = tokio::select! {
            next = upstream.next() => next,
            _ = tx.closed() => {
                summary.client_disconnected = true;
                break 'relay;
            }
        };
        match next {
            None => {
                if let Some(rest) = decoder.finish() {
                    if !forward(&tx, &mut summary, rest).await {
                        summary.client_disconnected = true;
                        break 'relay;
                    }
                }
                summary.completed = true;
                break 'relay;
            }
            Some(Err(err)) => {
                summary.error = Some(err.to_string());
                break 'relay;
            }
            Some(Ok(chunk)) => match decoder.push(&chunk) {
                Err(err) => {
                    summary.error = Some(err.to_string());
                    break 'relay;
                }
                Ok(frames) => {
                    for frame in frames {
                        if !forward(&tx, &mut summary, frame).await {
                            summary.client_disconnected = true;
                            break 'relay;
                        }
                    }
                }
            },
        }
    }

    summary.duration = started.elapsed();
    debug!(
        frames = summary.frames,
        completed = summary.completed,
        client_disconnected = summary.client_disconnected,
        "Stream relay finished"
    );
    on_complete(&summary);

    if summary.completed {
        let _ = tx.send(Ok(Bytes::from_static(sse::DONE_FRAME))).await;
    } else if let Some(error) = summary.error.clone() {
        let _ = tx.send(Err(io::Error::other(error))).await;
    }
}
