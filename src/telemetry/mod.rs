//! Telemetry: one outcome event per request, buffered, batched and persisted
//!
//! The recorder is the hot-path side (a lock-free ring), the writer is the
//! single periodic consumer, and the store is the durable side the budget
//! ledger replays at startup. Webhook notifications fire at the same points.

pub mod event;
pub mod recorder;
pub mod store;
pub mod webhook;
pub mod writer;

pub use event::{TelemetryEvent, TelemetryOutcome};
pub use recorder::{RecorderStats, TelemetryRecorder};
pub use store::{JsonlTelemetryStore, MemoryTelemetryStore, StoreError, TelemetryStore};
pub use webhook::{
    HttpWebhookSink, WebhookDelivery, WebhookDispatcher, WebhookError, WebhookPayload,
    WebhookSink, WebhookWorker,
};
pub use writer::TelemetryWriter;
