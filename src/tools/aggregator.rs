//! Output aggregation for downstream persistence.
//!
//! The execution node publishes structured events into a session-scoped
//! sink in a fixed order per request: the captured plan, one event per
//! tool execution, raw data rows tagged by source, the final synthesis,
//! and summary metrics. Sinks are pluggable; the default is an in-memory
//! bounded buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default buffer bound for the in-memory sink.
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Kind of aggregator event, in per-request publication order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanCaptured,
    ToolExecution,
    RawData,
    FinalSynthesis,
    PerformanceMetrics,
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(session_id: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Receives execution-node events for downstream persistence.
pub trait OutputSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Bounded in-memory sink, the default.
pub struct MemorySink {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Events recorded for one session, in publication order.
    pub fn session_events(&self, session_id: &str) -> Vec<Event> {
        self.buffer
            .lock()
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|event| event.session_id == session_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total buffered events.
    pub fn len(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputSink for MemorySink {
    fn publish(&self, event: Event) {
        let Ok(mut buffer) = self.buffer.lock() else {
            return;
        };
        buffer.push_back(event);
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
    }
}
