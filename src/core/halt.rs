//! Budget state and halt conditions.
//!
//! Halt conditions are evaluated after every row outcome. Once one fires,
//! no new rows are dispatched but rows already in flight finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::cost::CostSnapshot;

/// Running totals checked after each row
#[derive(Debug, Clone, Copy)]
pub struct BudgetState {
    /// Rows finalized in this execution (successes and failures)
    pub rows_processed: usize,
    pub rows_succeeded: usize,
    pub rows_failed: usize,
    pub cost: CostSnapshot,

    /// Both instants come from the cycle's clock; the runner refreshes
    /// `now` before every check
    pub started_at: Instant,
    pub now: Instant,
}

impl BudgetState {
    pub fn new(started_at: Instant) -> Self {
        Self {
            rows_processed: 0,
            rows_succeeded: 0,
            rows_failed: 0,
            cost: CostSnapshot::default(),
            started_at,
            now: started_at,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.now.saturating_duration_since(self.started_at)
    }
}

pub trait HaltCondition: Send + Sync {
    fn name(&self) -> &str;

    /// True when dispatch should stop
    fn check(&self, state: &BudgetState) -> bool;

    /// Human-readable explanation used when the condition fires
    fn describe(&self, state: &BudgetState) -> String {
        let _ = state;
        format!("halt condition '{}' triggered", self.name())
    }
}

/// Stops once spend reaches a ceiling
#[derive(Debug, Clone)]
pub struct MaxCost(pub f64);

impl HaltCondition for MaxCost {
    fn name(&self) -> &str {
        "max_cost_usd"
    }

    fn check(&self, state: &BudgetState) -> bool {
        state.cost.cost_usd >= self.0
    }

    fn describe(&self, state: &BudgetState) -> String {
        format!("Cost budget reached: ${:.4} >= ${:.4}", state.cost.cost_usd, self.0)
    }
}

/// Stops after a number of finalized rows
#[derive(Debug, Clone)]
pub struct MaxRows(pub usize);

impl HaltCondition for MaxRows {
    fn name(&self) -> &str {
        "max_rows"
    }

    fn check(&self, state: &BudgetState) -> bool {
        state.rows_processed >= self.0
    }

    fn describe(&self, state: &BudgetState) -> String {
        format!("Maximum rows reached: {} >= {}", state.rows_processed, self.0)
    }
}

/// Stops after a number of permanently failed rows
#[derive(Debug, Clone)]
pub struct MaxFailures(pub usize);

impl HaltCondition for MaxFailures {
    fn name(&self) -> &str {
        "max_failures"
    }

    fn check(&self, state: &BudgetState) -> bool {
        state.rows_failed >= self.0
    }

    fn describe(&self, state: &BudgetState) -> String {
        format!("Failure budget reached: {} >= {}", state.rows_failed, self.0)
    }
}

/// Stops once the execution has run for a duration on the cycle's clock
#[derive(Debug, Clone)]
pub struct MaxElapsed(pub Duration);

impl HaltCondition for MaxElapsed {
    fn name(&self) -> &str {
        "max_elapsed"
    }

    fn check(&self, state: &BudgetState) -> bool {
        state.elapsed() >= self.0
    }

    fn describe(&self, state: &BudgetState) -> String {
        format!(
            "Time budget reached: {}s >= {}s",
            state.elapsed().as_secs(),
            self.0.as_secs()
        )
    }
}

/// Budget limits as written in a suite definition. Each set limit becomes
/// one halt condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default)]
    pub max_cost_usd: Option<f64>,

    #[serde(default)]
    pub max_rows: Option<usize>,

    #[serde(default)]
    pub max_failures: Option<usize>,

    #[serde(default)]
    pub max_elapsed_seconds: Option<u64>,
}

impl BudgetLimits {
    pub fn conditions(&self) -> Vec<Arc<dyn HaltCondition>> {
        let mut out: Vec<Arc<dyn HaltCondition>> = Vec::new();
        if let Some(cost) = self.max_cost_usd {
            out.push(Arc::new(MaxCost(cost)));
        }
        if let Some(rows) = self.max_rows {
            out.push(Arc::new(MaxRows(rows)));
        }
        if let Some(failures) = self.max_failures {
            out.push(Arc::new(MaxFailures(failures)));
        }
        if let Some(secs) = self.max_elapsed_seconds {
            out.push(Arc::new(MaxElapsed(Duration::from_secs(secs))));
        }
        out
    }
}

/// External interrupt shared with the runner (e.g. wired to Ctrl-C)
#[derive(Debug, Clone, Default)]
pub struct HaltHandle {
    requested: Arc<AtomicBool>,
}

impl HaltHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_halt(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
