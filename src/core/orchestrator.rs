//! Suite orchestration.
//!
//! Sequences the cycles of one suite under a strategy:
//! - Standard runs every cycle in order; a failed cycle does not stop the next
//! - Experimental runs the baseline first, then each variant, and attaches
//!   baseline comparisons to every variant's result
//!
//! Each cycle's act phase (sink writes) runs right after its result exists.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::adapters::Sink;
use crate::domain::{Artifact, CycleResult, SecurityLevel, BASELINE_COMPARISON_KEY};

use super::artifact_pipeline::ArtifactPipeline;
use super::plugins::BaselineComparisonPlugin;
use super::runner::{CycleError, CycleRunner};
use super::suite::StrategyKind;

/// Errors that abort a whole suite
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("Experimental suite needs exactly one baseline cycle, found {0}")]
    BaselineCount(usize),

    #[error("Cycle name '{0}' is used more than once")]
    DuplicateCycle(String),

    #[error("Aggregation plugin '{plugin}' of cycle '{cycle}' collides with a reserved result key")]
    ReservedKey { cycle: String, plugin: String },

    #[error("Baseline cycle '{cycle}' failed: {source}")]
    BaselineFailed {
        cycle: String,
        #[source]
        source: CycleError,
    },
}

/// A cycle ready to run, with its act-phase settings
pub struct CycleJob {
    pub runner: CycleRunner,
    pub baseline: bool,
    pub sinks: Vec<Arc<dyn Sink>>,
    pub security_level: SecurityLevel,
    pub comparison_plugins: Vec<Arc<dyn BaselineComparisonPlugin>>,
}

impl CycleJob {
    pub fn new(runner: CycleRunner) -> Self {
        Self {
            runner,
            baseline: false,
            sinks: Vec::new(),
            security_level: SecurityLevel::default(),
            comparison_plugins: Vec::new(),
        }
    }

    pub fn as_baseline(mut self) -> Self {
        self.baseline = true;
        self
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn Sink>>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_comparison_plugins(
        mut self,
        plugins: Vec<Arc<dyn BaselineComparisonPlugin>>,
    ) -> Self {
        self.comparison_plugins = plugins;
        self
    }

    pub fn name(&self) -> &str {
        &self.runner.config().name
    }
}

/// A finished cycle and the artifacts its sinks produced
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub result: CycleResult,
    pub artifacts: Vec<Artifact>,
}

/// Per-cycle results of a suite. A failed cycle is reported, never raised.
#[derive(Debug, Default)]
pub struct SuiteResult {
    pub suite: String,
    pub cycles: BTreeMap<String, Result<CycleReport, CycleError>>,

    /// Cycle names in the order they were attempted
    pub order: Vec<String>,
}

impl SuiteResult {
    fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            ..Default::default()
        }
    }

    fn insert(&mut self, name: String, outcome: Result<CycleReport, CycleError>) {
        self.order.push(name.clone());
        self.cycles.insert(name, outcome);
    }

    pub fn get(&self, cycle: &str) -> Option<&Result<CycleReport, CycleError>> {
        self.cycles.get(cycle)
    }

    pub fn succeeded(&self) -> usize {
        self.cycles.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.cycles.values().filter(|r| r.is_err()).count()
    }

    /// Results in attempt order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<CycleReport, CycleError>)> {
        self.order
            .iter()
            .filter_map(|name| self.cycles.get(name).map(|r| (name.as_str(), r)))
    }
}

/// Runs the cycles of one suite
pub struct Orchestrator {
    suite: String,
    strategy: StrategyKind,
}

impl Orchestrator {
    pub fn new(suite: impl Into<String>, strategy: StrategyKind) -> Self {
        Self {
            suite: suite.into(),
            strategy,
        }
    }

    /// Check the job list before any cycle runs
    pub fn validate(&self, jobs: &[CycleJob]) -> Result<(), SuiteError> {
        let mut names = HashSet::new();
        for job in jobs {
            if !names.insert(job.name()) {
                return Err(SuiteError::DuplicateCycle(job.name().to_string()));
            }
            if let Some(plugin) = job
                .runner
                .aggregation_plugin_names()
                .find(|n| *n == BASELINE_COMPARISON_KEY)
            {
                return Err(SuiteError::ReservedKey {
                    cycle: job.name().to_string(),
                    plugin: plugin.to_string(),
                });
            }
        }

        if self.strategy == StrategyKind::Experimental {
            let baselines = jobs.iter().filter(|j| j.baseline).count();
            if baselines != 1 {
                return Err(SuiteError::BaselineCount(baselines));
            }
        }

        Ok(())
    }

    /// Run every cycle under the configured strategy
    #[instrument(skip(self, jobs), fields(suite = %self.suite, strategy = ?self.strategy))]
    pub async fn run(&self, jobs: Vec<CycleJob>) -> Result<SuiteResult, SuiteError> {
        self.validate(&jobs)?;
        info!(cycles = jobs.len(), "Starting suite");

        let result = match self.strategy {
            StrategyKind::Standard => self.run_standard(jobs).await,
            StrategyKind::Experimental => self.run_experimental(jobs).await?,
        };

        info!(
            succeeded = result.succeeded(),
            failed = result.failed(),
            "Suite finished"
        );
        Ok(result)
    }

    async fn run_standard(&self, jobs: Vec<CycleJob>) -> SuiteResult {
        let mut suite = SuiteResult::new(&self.suite);

        for job in jobs {
            let name = job.name().to_string();
            let outcome = run_cycle(&job, None).await;
            if let Err(ref e) = outcome {
                error!(cycle = %name, error = %e, "Cycle failed; continuing with next cycle");
            }
            suite.insert(name, outcome);
        }

        suite
    }

    async fn run_experimental(&self, jobs: Vec<CycleJob>) -> Result<SuiteResult, SuiteError> {
        let (baselines, variants): (Vec<CycleJob>, Vec<CycleJob>) =
            jobs.into_iter().partition(|j| j.baseline);
        let Some(baseline) = baselines.into_iter().next() else {
            return Err(SuiteError::BaselineCount(0));
        };

        let mut suite = SuiteResult::new(&self.suite);
        let baseline_name = baseline.name().to_string();

        let report = run_cycle(&baseline, None)
            .await
            .map_err(|source| SuiteError::BaselineFailed {
                cycle: baseline_name.clone(),
                source,
            })?;

        if let Some(ref halt) = report.result.halted {
            warn!(cycle = %baseline_name, reason = %halt.message, "Baseline halted early; comparing against partial result");
        }
        let baseline_result = report.result.clone();
        suite.insert(baseline_name, Ok(report));

        for job in variants {
            let name = job.name().to_string();
            let outcome = run_cycle(&job, Some(&baseline_result)).await;
            if let Err(ref e) = outcome {
                error!(cycle = %name, error = %e, "Variant cycle failed; continuing with next variant");
            }
            suite.insert(name, outcome);
        }

        Ok(suite)
    }
}

/// Run one cycle end to end: decide, compare, act
async fn run_cycle(
    job: &CycleJob,
    baseline: Option<&CycleResult>,
) -> Result<CycleReport, CycleError> {
    let pipeline = ArtifactPipeline::new(job.sinks.clone());

    // Sink graph problems surface before any row is processed
    pipeline.plan(job.security_level)?;

    let mut result = job.runner.run().await?;

    if let Some(baseline) = baseline {
        if !job.comparison_plugins.is_empty() {
            let mut comparisons = Map::new();
            for plugin in &job.comparison_plugins {
                let value = plugin
                    .apply(baseline, &result)
                    .map_err(CycleError::Comparison)?;
                comparisons.insert(plugin.name().to_string(), value);
            }
            result
                .aggregates
                .insert(BASELINE_COMPARISON_KEY.to_string(), Value::Object(comparisons));
        }
    }

    let store = pipeline.execute(&result, job.security_level).await?;

    Ok(CycleReport {
        result,
        artifacts: store.into_artifacts(),
    })
}
