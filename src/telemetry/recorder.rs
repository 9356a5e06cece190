//! Lock-free telemetry buffer
//!
//! Request handlers push events with `force_push`, so recording never blocks
//! and never fails. When the writer falls behind and the ring is full, the
//! oldest event is overwritten and counted as dropped.

use crate::telemetry::event::TelemetryEvent;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderStats {
    pub recorded: u64,
    pub drained: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Debug)]
pub struct TelemetryRecorder {
    queue: ArrayQueue<TelemetryEvent>,
    recorded: AtomicU64,
    drained: AtomicU64,
    dropped: AtomicU64,
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl TelemetryRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            recorded: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn record(&self, event: TelemetryEvent) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if let Some(overwritten) = self.queue.force_push(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                event_id = %overwritten.id,
                dropped,
                "Telemetry buffer full, oldest event dropped"
            );
        }
    }

    /// Take everything currently buffered, oldest first
    pub fn drain(&self) -> Vec<TelemetryEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        self.drained
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        events
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.queue.len(),
        }
    }
}
