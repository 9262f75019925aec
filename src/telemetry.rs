//! Execution traces for generation calls.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use crate::ai::Usage;
use crate::extract::FieldValues;

/// One `forward` call, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub signature_hash: String,
    pub inputs: FieldValues,
    /// Visible outputs; empty when the call failed.
    pub outputs: FieldValues,
    pub model_name: Option<String>,
    pub model_calls: u32,
    pub retries: u32,
    pub function_calls: usize,
    pub usage: Usage,
    pub error: Option<String>,
}

impl TraceEntry {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Sink for execution traces.
pub trait Telemetry: Send + Sync {
    fn record(&self, entry: TraceEntry);
    fn flush(&self);
}

/// Collects traces in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    traces: Mutex<Vec<TraceEntry>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<TraceEntry> {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Telemetry for MemoryTelemetry {
    fn record(&self, entry: TraceEntry) {
        log::debug!(
            "trace recorded for signature {} ({} model calls)",
            entry.signature_hash,
            entry.model_calls
        );
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn flush(&self) {
        // Nothing buffered outside the vector.
    }
}
