//! Periodic writer draining the telemetry buffer into the store

use crate::domain::duration_ms;
use crate::telemetry::recorder::TelemetryRecorder;
use crate::telemetry::store::TelemetryStore;
use crate::telemetry::event::TelemetryEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Single consumer of the telemetry buffer
pub struct TelemetryWriter {
    recorder: Arc<TelemetryRecorder>,
    store: Arc<dyn TelemetryStore>,
    flush_interval: Duration,
    /// Events from a failed append, retried ahead of newer ones
    pending: Vec<TelemetryEvent>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl TelemetryWriter {
    pub fn new(
        recorder: Arc<TelemetryRecorder>,
        store: Arc<dyn TelemetryStore>,
        flush_interval: Duration,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer = Self {
            recorder,
            store,
            flush_interval,
            pending: Vec::new(),
            shutdown_rx,
        };

        (writer, shutdown_tx)
    }

    /// Flush on every tick until shutdown, then drain one last time
    pub async fn run(mut self) {
        info!(interval_ms = duration_ms(self.flush_interval), "Telemetry writer started");
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Telemetry writer shutting down");
                    break;
                }
            }
        }

        self.flush().await;
        if !self.pending.is_empty() {
            error!(lost = self.pending.len(), "Telemetry events could not be persisted before shutdown");
        }
        info!("Telemetry writer stopped");
    }

    /// Append everything buffered as one batch; returns how many were written
    pub async fn flush(&mut self) -> usize {
        let drained = self.recorder.drain();
        if drained.is_empty() && self.pending.is_empty() {
            return 0;
        }

        let mut batch = std::mem::take(&mut self.pending);
        batch.extend(drained);

        match self.store.append_batch(&batch).await {
            Ok(()) => {
                debug!(events = batch.len(), "Telemetry batch persisted");
                batch.len()
            }
            Err(err) => {
                error!(error = %err, events = batch.len(), "Failed to persist telemetry batch");
                let capacity = self.recorder.capacity();
                if batch.len() > capacity {
                    let overflow = batch.len() - capacity;
                    warn!(dropped = overflow, "Discarding oldest unpersisted telemetry events");
                    batch.drain(..overflow);
                }
                self.pending = batch;
                0
            }
        }
    }
}
