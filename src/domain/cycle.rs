//! Cycle summary reconstructed from journal events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};

/// Lifecycle state of a cycle as recorded in its journal
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CycleState {
    /// No events yet
    #[default]
    Pending,

    Running,

    Completed,

    /// Completed after a halt condition stopped dispatch
    Halted { reason: String },

    Failed { error: String },
}

/// Per-row status derived from the latest event for that row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    InFlight,
    Retrying,
    Completed,
    Failed,
}

/// What the journal says about a cycle across all its executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: String,
    pub state: CycleState,

    /// Number of times the cycle has been started (first run plus resumes)
    pub executions: usize,

    pub last_execution: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Latest state of each row seen in the journal
    pub rows: HashMap<String, RowState>,

    /// Total retry events across all rows
    pub retries: usize,
}

impl CycleSummary {
    pub fn new(cycle: impl Into<String>) -> Self {
        Self {
            cycle: cycle.into(),
            state: CycleState::Pending,
            executions: 0,
            last_execution: None,
            started_at: None,
            completed_at: None,
            rows: HashMap::new(),
            retries: 0,
        }
    }

    /// Reconstruct a summary from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let mut summary = Self::new(first.cycle.clone());
        for event in events {
            summary.apply_event(event);
        }
        Some(summary)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::CycleStarted => {
                self.state = CycleState::Running;
                self.executions += 1;
                self.last_execution = Some(event.execution_id);
                self.started_at = Some(event.timestamp);
                self.completed_at = None;
            }
            EventType::HaltRequested => {
                self.state = CycleState::Halted {
                    reason: event.summary.clone(),
                };
            }
            EventType::CycleCompleted => {
                if !matches!(self.state, CycleState::Halted { .. }) {
                    self.state = CycleState::Completed;
                }
                self.completed_at = Some(event.timestamp);
            }
            EventType::CycleFailed => {
                self.state = CycleState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RowStarted => self.set_row(event, RowState::InFlight),
            EventType::RowRetrying => {
                self.retries += 1;
                self.set_row(event, RowState::Retrying);
            }
            EventType::RowCompleted => self.set_row(event, RowState::Completed),
            EventType::RowFailed => self.set_row(event, RowState::Failed),
        }
    }

    fn set_row(&mut self, event: &Event, state: RowState) {
        if let Some(ref key) = event.row_key {
            self.rows.insert(key.clone(), state);
        }
    }

    /// Count rows currently in the given state
    pub fn count(&self, state: RowState) -> usize {
        self.rows.values().filter(|s| **s == state).count()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CycleState::Running)
    }
}
