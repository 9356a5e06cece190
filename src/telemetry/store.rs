//! Durable telemetry storage
//!
//! The gateway only needs two operations from a store: append a batch, and
//! load today's rows back for the budget ledger at startup.

use crate::telemetry::event::TelemetryEvent;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("telemetry store I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode telemetry event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Every persisted event whose timestamp falls on the current UTC day
    async fn load_today_rows(&self) -> Result<Vec<TelemetryEvent>, StoreError>;

    async fn append_batch(&self, events: &[TelemetryEvent]) -> Result<(), StoreError>;
}

fn is_today(event: &TelemetryEvent) -> bool {
    event.timestamp.date_naive() == Utc::now().date_naive()
}

/// Process-local store, for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct MemoryTelemetryStore {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<TelemetryEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    async fn load_today_rows(&self) -> Result<Vec<TelemetryEvent>, StoreError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| is_today(event))
            .cloned()
            .collect())
    }

    async fn append_batch(&self, events: &[TelemetryEvent]) -> Result<(), StoreError> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Append-only JSON-lines file, one event per line
#[derive(Debug, Clone)]
pub struct JsonlTelemetryStore {
    path: PathBuf,
}

impl JsonlTelemetryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl TelemetryStore for JsonlTelemetryStore {
    async fn load_today_rows(&self) -> Result<Vec<TelemetryEvent>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error(err)),
        };

        let mut events = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryEvent>(line) {
                Ok(event) if is_today(&event) => events.push(event),
                Ok(_) => {}
                // A crash mid-write leaves at most one torn trailing line
                Err(err) => warn!(line = index + 1, error = %err, "Skipping unreadable telemetry row"),
            }
        }
        debug!(rows = events.len(), path = %self.path.display(), "Loaded today's telemetry rows");
        Ok(events)
    }

    async fn append_batch(&self, events: &[TelemetryEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buffer = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buffer, event)?;
            buffer.push(b'\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        file.write_all(&buffer)
            .await
            .map_err(|err| self.io_error(err))?;
        file.sync_data().await.map_err(|err| self.io_error(err))?;
        Ok(())
    }
}
