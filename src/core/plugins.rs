//! Plugin interfaces invoked at fixed points of a cycle, plus built-ins.
//!
//! - Row plugins run after a successful decision call, in order. A rejection
//!   fails the row without retrying.
//! - Aggregation plugins run once over all outcomes. A failure is fatal to
//!   the cycle.
//! - Baseline comparison plugins run for each variant of an experimental
//!   suite with the baseline's result.
//!
//! Halt conditions live in [`super::halt`].

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::{CycleResult, DecisionResponse, Row, RowOutcome};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("plugin '{plugin}' failed: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

pub trait RowPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Derive metrics for a row from its response, or reject the row
    fn apply(&self, row: &Row, response: &DecisionResponse) -> Result<Value, PluginError>;
}

pub trait AggregationPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Outcomes arrive in table order
    fn apply(&self, outcomes: &[RowOutcome]) -> Result<Value, PluginError>;
}

pub trait BaselineComparisonPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, baseline: &CycleResult, variant: &CycleResult) -> Result<Value, PluginError>;
}

/// Resolve a dotted path (`a.b.c`) inside a JSON value
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

// ============================================================================
// Row plugins
// ============================================================================

/// Rejects responses whose content lacks any of the listed fields
#[derive(Debug, Clone)]
pub struct RequireFields {
    fields: Vec<String>,
}

impl RequireFields {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl RowPlugin for RequireFields {
    fn name(&self) -> &str {
        "require_fields"
    }

    fn apply(&self, _row: &Row, response: &DecisionResponse) -> Result<Value, PluginError> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| lookup(&response.content, f).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(Value::Bool(true))
        } else {
            Err(PluginError::new(
                self.name(),
                format!("response is missing required fields: {}", missing.join(", ")),
            ))
        }
    }
}

/// Copies selected response fields into the outcome's metrics
#[derive(Debug, Clone)]
pub struct ExtractFields {
    fields: Vec<String>,
}

impl ExtractFields {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl RowPlugin for ExtractFields {
    fn name(&self) -> &str {
        "extract_fields"
    }

    fn apply(&self, _row: &Row, response: &DecisionResponse) -> Result<Value, PluginError> {
        let mut out = Map::new();
        for field in &self.fields {
            let value = lookup(&response.content, field).cloned().unwrap_or(Value::Null);
            out.insert(field.clone(), value);
        }
        Ok(Value::Object(out))
    }
}

// ============================================================================
// Aggregation plugins
// ============================================================================

/// Counts outcomes per status and collects failure reasons
#[derive(Debug, Default, Clone)]
pub struct StatusCounts;

impl AggregationPlugin for StatusCounts {
    fn name(&self) -> &str {
        "status_counts"
    }

    fn apply(&self, outcomes: &[RowOutcome]) -> Result<Value, PluginError> {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let failed: Vec<Value> = outcomes
            .iter()
            .filter_map(|o| {
                o.error()
                    .map(|e| json!({ "key": o.key.as_str(), "error": e }))
            })
            .collect();
        let resumed = outcomes.len() - succeeded - failed.len();

        Ok(json!({
            "total": outcomes.len(),
            "succeeded": succeeded,
            "failed": failed.len(),
            "resumed": resumed,
            "failures": failed,
        }))
    }
}

/// Mean/min/max of a numeric field of successful responses
#[derive(Debug, Clone)]
pub struct ScoreStats {
    field: String,
}

impl ScoreStats {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

/// Numeric values of `field` across successful outcomes
fn scores<'a>(outcomes: &'a [RowOutcome], field: &'a str) -> impl Iterator<Item = f64> + 'a {
    outcomes
        .iter()
        .filter_map(move |o| o.response().and_then(|r| lookup(r, field)))
        .filter_map(Value::as_f64)
}

impl AggregationPlugin for ScoreStats {
    fn name(&self) -> &str {
        "score_stats"
    }

    fn apply(&self, outcomes: &[RowOutcome]) -> Result<Value, PluginError> {
        let values: Vec<f64> = scores(outcomes, &self.field).collect();
        if values.is_empty() {
            return Ok(json!({ "field": self.field, "count": 0 }));
        }

        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Ok(json!({
            "field": self.field,
            "count": values.len(),
            "mean": sum / values.len() as f64,
            "min": min,
            "max": max,
        }))
    }
}

// ============================================================================
// Baseline comparison plugins
// ============================================================================

/// Difference in the mean of a numeric field, variant minus baseline
#[derive(Debug, Clone)]
pub struct ScoreDelta {
    field: String,
}

impl ScoreDelta {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    fn mean(&self, result: &CycleResult) -> Option<f64> {
        let values: Vec<f64> = scores(&result.outcomes, &self.field).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

impl BaselineComparisonPlugin for ScoreDelta {
    fn name(&self) -> &str {
        "score_delta"
    }

    fn apply(&self, baseline: &CycleResult, variant: &CycleResult) -> Result<Value, PluginError> {
        let base = self.mean(baseline);
        let var = self.mean(variant);
        let delta = match (base, var) {
            (Some(b), Some(v)) => Some(v - b),
            _ => None,
        };
        Ok(json!({
            "field": self.field,
            "baseline_mean": base,
            "variant_mean": var,
            "delta": delta,
        }))
    }
}

/// Difference in success rate, variant minus baseline
#[derive(Debug, Default, Clone)]
pub struct SuccessRateDelta;

impl BaselineComparisonPlugin for SuccessRateDelta {
    fn name(&self) -> &str {
        "success_rate_delta"
    }

    fn apply(&self, baseline: &CycleResult, variant: &CycleResult) -> Result<Value, PluginError> {
        let base = baseline.success_rate();
        let var = variant.success_rate();
        Ok(json!({
            "baseline": base,
            "variant": var,
            "delta": var - base,
        }))
    }
}

/// Run every row plugin in order, collecting metrics by plugin name
pub fn apply_row_plugins(
    plugins: &[std::sync::Arc<dyn RowPlugin>],
    row: &Row,
    response: &DecisionResponse,
) -> Result<BTreeMap<String, Value>, PluginError> {
    let mut metrics = BTreeMap::new();
    for plugin in plugins {
        let value = plugin.apply(row, response)?;
        metrics.insert(plugin.name().to_string(), value);
    }
    Ok(metrics)
}
