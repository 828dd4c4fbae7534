//! Per-row outcomes and the per-cycle result payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::row::RowKey;

/// Reserved aggregate key under which baseline comparisons are attached
pub const BASELINE_COMPARISON_KEY: &str = "baseline_comparison";

/// Final status of a single row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RowStatus {
    /// Decision succeeded and every row plugin accepted the response
    Succeeded {
        /// Content returned by the decision system
        response: Value,
        /// Output of each row plugin, keyed by plugin name
        #[serde(default)]
        metrics: BTreeMap<String, Value>,
    },

    /// Retries exhausted, a fatal decision error, or a plugin rejection
    Failed {
        error: String,
        /// True when the failure came from a row plugin rejecting the row
        #[serde(default)]
        rejected: bool,
    },

    /// Finalized in an earlier run whose outcome was not stored
    Resumed,
}

/// Outcome of processing one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub key: RowKey,

    /// Position in the source table at load time
    pub index: usize,

    /// Number of decision attempts made
    pub attempts: u32,

    #[serde(flatten)]
    pub status: RowStatus,
}

impl RowOutcome {
    pub fn succeeded(
        key: RowKey,
        index: usize,
        attempts: u32,
        response: Value,
        metrics: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            key,
            index,
            attempts,
            status: RowStatus::Succeeded { response, metrics },
        }
    }

    pub fn failed(key: RowKey, index: usize, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            key,
            index,
            attempts,
            status: RowStatus::Failed {
                error: error.into(),
                rejected: false,
            },
        }
    }

    pub fn rejected(key: RowKey, index: usize, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            key,
            index,
            attempts,
            status: RowStatus::Failed {
                error: error.into(),
                rejected: true,
            },
        }
    }

    pub fn resumed(key: RowKey, index: usize) -> Self {
        Self {
            key,
            index,
            attempts: 0,
            status: RowStatus::Resumed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RowStatus::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, RowStatus::Failed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            RowStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Value> {
        match &self.status {
            RowStatus::Succeeded { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Why dispatch of new rows stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReason {
    /// Name of the halt condition (or "interrupt")
    pub condition: String,
    pub message: String,
}

/// Running counters summarised on the result
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub rows_total: usize,
    pub rows_succeeded: usize,
    pub rows_failed: usize,
    pub rows_resumed: usize,
    pub rows_skipped: usize,
    pub cost_usd: f64,
    pub tokens: u64,
}

/// The per-cycle payload handed to the act phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle: String,

    /// Outcomes in source table order
    pub outcomes: Vec<RowOutcome>,

    /// Aggregation plugin outputs keyed by plugin name
    pub aggregates: BTreeMap<String, Value>,

    /// Set when a halt condition or interrupt stopped dispatch
    pub halted: Option<HaltReason>,

    pub stats: CycleStats,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CycleResult {
    /// Outcomes that ended in failure
    pub fn failures(&self) -> impl Iterator<Item = &RowOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn outcome(&self, key: &RowKey) -> Option<&RowOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }

    /// Baseline comparison outputs, keyed by plugin name
    pub fn comparisons(&self) -> Option<&Value> {
        self.aggregates.get(BASELINE_COMPARISON_KEY)
    }

    /// Fraction of finalized rows that succeeded (resumed rows excluded)
    pub fn success_rate(&self) -> f64 {
        let decided = self.stats.rows_succeeded + self.stats.rows_failed;
        if decided == 0 {
            return 0.0;
        }
        self.stats.rows_succeeded as f64 / decided as f64
    }
}
