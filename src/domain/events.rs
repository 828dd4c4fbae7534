//! Journal events recorded while a cycle executes.
//!
//! The journal is append-only. A cycle's summary can be reconstructed by
//! replaying its events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a cycle's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Execution this event belongs to (a resumed cycle gets a new one)
    pub execution_id: Uuid,

    /// Name of the cycle
    pub cycle: String,

    /// Row key (if applicable)
    pub row_key: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Decision attempt number (row events only)
    pub attempt: Option<u32>,

    /// Human-readable summary (NO row contents)
    pub summary: String,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        execution_id: Uuid,
        cycle: impl Into<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            execution_id,
            cycle: cycle.into(),
            row_key: None,
            event_type,
            attempt: None,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_row(mut self, row_key: impl Into<String>, attempt: u32) -> Self {
        self.row_key = Some(row_key.into());
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events that can occur during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Source loaded, dispatch about to begin
    CycleStarted,

    /// Aggregation finished and the result was handed off
    CycleCompleted,

    /// A fatal-cycle error aborted the cycle
    CycleFailed,

    /// A decision attempt for a row is starting
    RowStarted,

    /// A transient failure will be retried after a delay
    RowRetrying,

    /// The row's outcome was finalized as a success
    RowCompleted,

    /// The row's outcome was finalized as a permanent failure
    RowFailed,

    /// A halt condition or interrupt stopped dispatch
    HaltRequested,
}
