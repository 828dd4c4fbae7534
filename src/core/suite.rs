//! Suite definitions and loading.
//!
//! A suite is a YAML document naming an orchestration strategy and the
//! cycles it runs. Source and decision settings may be given once at the
//! suite level and overridden per cycle.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactReference, SecurityLevel};

use super::cost::CostSettings;
use super::halt::BudgetLimits;
use super::rate_limit::RateLimitSettings;
use super::retry::RetryPolicy;

/// A complete suite definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteDefinition {
    /// Suite name (also the directory under `runs/`)
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub strategy: StrategyKind,

    /// Default source for cycles that don't set one
    #[serde(default)]
    pub source: Option<SourceSpec>,

    /// Default decision system for cycles that don't set one
    #[serde(default)]
    pub decision: Option<DecisionSpec>,

    pub cycles: Vec<CycleDefinition>,
}

/// How the cycles of a suite are sequenced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Every cycle runs independently, in order
    #[default]
    Standard,

    /// One baseline runs first; variants are compared against it
    Experimental,
}

impl SuiteDefinition {
    /// Load a suite from a YAML file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read suite file: {}", path.display()))?;

        let mut suite = Self::from_yaml(&content)?;
        if let Some(base) = path.parent() {
            suite.rebase_paths(base);
        }
        Ok(suite)
    }

    /// Parse a suite from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse suite YAML")
    }

    fn rebase_paths(&mut self, base: &Path) {
        let rebase = |spec: &mut SourceSpec| match spec {
            SourceSpec::Jsonl { path } if path.is_relative() => *path = base.join(&*path),
            SourceSpec::Jsonl { .. } => {}
        };
        if let Some(ref mut source) = self.source {
            rebase(source);
        }
        for cycle in &mut self.cycles {
            if let Some(ref mut source) = cycle.source {
                rebase(source);
            }
        }
    }

    /// Validate the suite definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Suite name cannot be empty");
        }
        validate_path_segment("Suite", &self.name)?;

        if self.cycles.is_empty() {
            anyhow::bail!("Suite must have at least one cycle");
        }

        let mut names = HashSet::new();
        for (i, cycle) in self.cycles.iter().enumerate() {
            if cycle.name.trim().is_empty() {
                anyhow::bail!("Cycle {} has an empty name", i);
            }
            validate_path_segment("Cycle", &cycle.name)?;
            if !names.insert(cycle.name.as_str()) {
                anyhow::bail!("Cycle name '{}' is used more than once", cycle.name);
            }

            cycle
                .validate()
                .with_context(|| format!("Invalid cycle '{}'", cycle.name))?;

            if self.source_for(cycle).is_none() {
                anyhow::bail!("Cycle '{}' has no source and the suite sets none", cycle.name);
            }
            if self.decision_for(cycle).is_none() {
                anyhow::bail!(
                    "Cycle '{}' has no decision system and the suite sets none",
                    cycle.name
                );
            }
        }

        let baselines = self.cycles.iter().filter(|c| c.baseline).count();
        match self.strategy {
            StrategyKind::Experimental if baselines != 1 => {
                anyhow::bail!(
                    "Experimental suite must mark exactly one cycle as baseline (found {})",
                    baselines
                );
            }
            StrategyKind::Standard if baselines > 0 => {
                anyhow::bail!("Only experimental suites may declare a baseline cycle");
            }
            _ => {}
        }

        Ok(())
    }

    pub fn get_cycle(&self, name: &str) -> Option<&CycleDefinition> {
        self.cycles.iter().find(|c| c.name == name)
    }

    pub fn source_for<'a>(&'a self, cycle: &'a CycleDefinition) -> Option<&'a SourceSpec> {
        cycle.source.as_ref().or(self.source.as_ref())
    }

    pub fn decision_for<'a>(&'a self, cycle: &'a CycleDefinition) -> Option<&'a DecisionSpec> {
        cycle.decision.as_ref().or(self.decision.as_ref())
    }
}

fn validate_path_segment(what: &str, name: &str) -> Result<()> {
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        anyhow::bail!("{} name '{}' must be usable as a directory name", what, name);
    }
    Ok(())
}

/// One cycle of a suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleDefinition {
    /// Cycle name (unique within the suite)
    pub name: String,

    /// Marks the reference cycle of an experimental suite
    #[serde(default)]
    pub baseline: bool,

    /// Static instruction sent with every row
    #[serde(default)]
    pub instruction: String,

    /// Concurrent row workers (1 = sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub cost: CostSettings,

    #[serde(default)]
    pub budget: BudgetLimits,

    /// Classification of the cycle's result; every sink must be at or above it
    #[serde(default)]
    pub security_level: SecurityLevel,

    #[serde(default)]
    pub source: Option<SourceSpec>,

    #[serde(default)]
    pub decision: Option<DecisionSpec>,

    #[serde(default)]
    pub row_plugins: Vec<RowPluginSpec>,

    #[serde(default)]
    pub aggregation_plugins: Vec<AggregationPluginSpec>,

    /// Only meaningful for variants of an experimental suite
    #[serde(default)]
    pub comparison_plugins: Vec<ComparisonPluginSpec>,

    #[serde(default)]
    pub sinks: Vec<SinkSpec>,
}

fn default_workers() -> usize {
    1
}

impl CycleDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }

        self.retry.validate().map_err(anyhow::Error::msg)?;

        if self.checkpoint.key_field.trim().is_empty() {
            anyhow::bail!("checkpoint.key_field cannot be empty");
        }

        if let RateLimitSettings::FixedWindow { requests: 0, .. }
        | RateLimitSettings::Adaptive { requests: 0, .. } = self.rate_limit
        {
            anyhow::bail!("rate_limit.requests must be at least 1");
        }

        let mut sink_names = HashSet::new();
        for sink in &self.sinks {
            if sink.name.trim().is_empty() {
                anyhow::bail!("Sink has an empty name");
            }
            validate_path_segment("Sink", &sink.name)?;
            if !sink_names.insert(sink.name.as_str()) {
                anyhow::bail!("Sink name '{}' is used more than once", sink.name);
            }
            sink.references()
                .with_context(|| format!("Invalid consumes list of sink '{}'", sink.name))?;
        }

        Ok(())
    }
}

/// Checkpointing settings for a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Record field holding each row's unique key
    #[serde(default = "default_key_field")]
    pub key_field: String,

    /// Keep row outcomes in the checkpoint so a resumed result is complete
    #[serde(default = "default_true")]
    pub store_outcomes: bool,

    /// Refuse to resume if the source table's keys changed
    #[serde(default)]
    pub validate_source: bool,
}

fn default_true() -> bool {
    true
}

fn default_key_field() -> String {
    "id".to_string()
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            key_field: default_key_field(),
            store_outcomes: true,
            validate_source: false,
        }
    }
}

/// Where a cycle's table comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// One JSON object per line
    Jsonl { path: PathBuf },
}

/// Which decision system answers each row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionSpec {
    /// Returns the row's input as its response (dry runs)
    Echo,

    /// Runs a local program per row: request JSON on stdin, response JSON on stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },

    /// POSTs the request JSON to an endpoint
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },
}

fn default_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowPluginSpec {
    RequireFields { fields: Vec<String> },
    ExtractFields { fields: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationPluginSpec {
    StatusCounts,
    ScoreStats { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparisonPluginSpec {
    ScoreDelta { field: String },
    SuccessRateDelta,
}

/// One output sink of a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    /// Sink name (unique within the cycle); prefixes its artifact ids
    pub name: String,

    #[serde(flatten)]
    pub kind: SinkKind,

    #[serde(default)]
    pub security_level: SecurityLevel,

    /// Alias for the sink's primary artifact
    #[serde(default)]
    pub alias: Option<String>,

    /// References (`<sink>.<name>`, `@alias`, `type:<type>`) this sink needs
    #[serde(default)]
    pub consumes: Vec<String>,
}

impl SinkSpec {
    pub fn references(&self) -> Result<Vec<ArtifactReference>> {
        self.consumes
            .iter()
            .map(|r| r.parse::<ArtifactReference>().map_err(anyhow::Error::msg))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkKind {
    /// The whole cycle result as one JSON document
    JsonResults {
        #[serde(default)]
        file: Option<String>,
    },

    /// One outcome per line
    JsonlOutcomes {
        #[serde(default)]
        file: Option<String>,
    },

    /// Digests of every consumed artifact
    Manifest {
        #[serde(default)]
        file: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
name: spam-eval
strategy: experimental
source:
  kind: jsonl
  path: rows.jsonl
decision:
  kind: echo
cycles:
  - name: baseline
    baseline: true
    workers: 4
    checkpoint:
      key_field: message_id
    rate_limit:
      kind: fixed_window
      requests: 60
    sinks:
      - name: results
        kind: json_results
        alias: results
      - name: manifest
        kind: manifest
        security_level: internal
        consumes: ["@results"]
  - name: strict
    instruction: "Be strict"
    comparison_plugins:
      - kind: success_rate_delta
"#;

    #[test]
    fn test_parse_suite() {
        let suite = SuiteDefinition::from_yaml(SUITE).unwrap();
        assert_eq!(suite.strategy, StrategyKind::Experimental);
        assert_eq!(suite.cycles.len(), 2);

        let baseline = &suite.cycles[0];
        assert!(baseline.baseline);
        assert_eq!(baseline.workers, 4);
        assert_eq!(baseline.checkpoint.key_field, "message_id");
        assert!(baseline.checkpoint.store_outcomes);
        assert_eq!(baseline.sinks[1].security_level, SecurityLevel::Internal);
        assert_eq!(
            baseline.sinks[1].references().unwrap(),
            vec![ArtifactReference::Alias("results".into())]
        );

        let variant = &suite.cycles[1];
        assert_eq!(variant.workers, 1);
        assert_eq!(variant.retry, RetryPolicy::default());
        assert_eq!(suite.source_for(variant), suite.source.as_ref());

        suite.validate().unwrap();
    }

    #[test]
    fn test_experimental_requires_one_baseline() {
        let mut suite = SuiteDefinition::from_yaml(SUITE).unwrap();
        suite.cycles[1].baseline = true;
        assert!(suite.validate().is_err());

        suite.cycles[0].baseline = false;
        suite.cycles[1].baseline = false;
        assert!(suite.validate().is_err());
    }

    #[test]
    fn test_duplicate_cycle_names() {
        let mut suite = SuiteDefinition::from_yaml(SUITE).unwrap();
        suite.cycles[1].name = "baseline".into();
        let err = suite.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_decision() {
        let mut suite = SuiteDefinition::from_yaml(SUITE).unwrap();
        suite.decision = None;
        assert!(suite.validate().is_err());
    }

    #[test]
    fn test_relative_paths_rebased() {
        let mut suite = SuiteDefinition::from_yaml(SUITE).unwrap();
        suite.rebase_paths(Path::new("/data/suites"));
        assert_eq!(
            suite.source,
            Some(SourceSpec::Jsonl {
                path: PathBuf::from("/data/suites/rows.jsonl")
            })
        );
    }
}
