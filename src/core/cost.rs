//! Spend accounting for decision calls.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::domain::Usage;

/// Running totals exposed to halt conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl CostSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

pub trait CostTracker: Send + Sync {
    /// Record the usage reported by one decision response
    fn record(&self, usage: &Usage);

    fn snapshot(&self) -> CostSnapshot;
}

/// Tracker for cycles without budget constraints
#[derive(Debug, Default)]
pub struct NoopCostTracker;

impl CostTracker for NoopCostTracker {
    fn record(&self, _usage: &Usage) {}

    fn snapshot(&self) -> CostSnapshot {
        CostSnapshot::default()
    }
}

/// Prices tokens per thousand, unless the response reports its own cost
#[derive(Debug)]
pub struct TokenCostTracker {
    prompt_per_1k: f64,
    completion_per_1k: f64,
    totals: Mutex<CostSnapshot>,
}

impl TokenCostTracker {
    pub fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
            totals: Mutex::new(CostSnapshot::default()),
        }
    }

    fn price(&self, usage: &Usage) -> f64 {
        usage.cost_usd.unwrap_or_else(|| {
            usage.prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
                + usage.completion_tokens as f64 / 1000.0 * self.completion_per_1k
        })
    }
}

impl CostTracker for TokenCostTracker {
    fn record(&self, usage: &Usage) {
        let cost = self.price(usage);
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.calls = totals.calls.saturating_add(1);
        totals.prompt_tokens = totals.prompt_tokens.saturating_add(usage.prompt_tokens);
        totals.completion_tokens = totals.completion_tokens.saturating_add(usage.completion_tokens);
        totals.cost_usd += cost;
    }

    fn snapshot(&self) -> CostSnapshot {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cost settings as written in a suite definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostSettings {
    #[default]
    None,

    PerToken {
        #[serde(default)]
        prompt_per_1k: f64,
        #[serde(default)]
        completion_per_1k: f64,
    },
}

impl CostSettings {
    pub fn build(&self) -> std::sync::Arc<dyn CostTracker> {
        match self {
            Self::None => std::sync::Arc::new(NoopCostTracker),
            Self::PerToken {
                prompt_per_1k,
                completion_per_1k,
            } => std::sync::Arc::new(TokenCostTracker::new(*prompt_per_1k, *completion_per_1k)),
        }
    }
}
