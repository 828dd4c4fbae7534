//! Turns a suite definition into runnable cycle jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::adapters::sinks::FileSinkConfig;
use crate::adapters::{
    CommandDecision, DataSource, DecisionSystem, EchoDecision, HttpDecision, JsonResultsSink,
    JsonlOutcomesSink, JsonlSource, ManifestSink, Sink,
};
use crate::config;
use crate::core::halt::HaltHandle;
use crate::core::orchestrator::CycleJob;
use crate::core::plugins::{
    AggregationPlugin, BaselineComparisonPlugin, ExtractFields, RequireFields, RowPlugin,
    ScoreDelta, ScoreStats, StatusCounts, SuccessRateDelta,
};
use crate::core::runner::{CheckpointOptions, CycleConfig, CycleRunner};
use crate::core::suite::{
    AggregationPluginSpec, ComparisonPluginSpec, CycleDefinition, DecisionSpec, RowPluginSpec,
    SinkKind, SinkSpec, SourceSpec, StrategyKind, SuiteDefinition,
};

/// Subdirectory of a cycle directory that holds sink outputs
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Build jobs for every cycle, or for `only` one cycle.
///
/// Under the experimental strategy a single variant still needs its
/// baseline, so the baseline is always included.
pub fn build_jobs(
    suite: &SuiteDefinition,
    only: Option<&str>,
    halt: &HaltHandle,
) -> Result<Vec<CycleJob>> {
    if let Some(name) = only {
        if suite.get_cycle(name).is_none() {
            anyhow::bail!("Cycle '{}' not found in suite '{}'", name, suite.name);
        }
    }

    suite
        .cycles
        .iter()
        .filter(|c| match only {
            None => true,
            Some(name) => {
                c.name == name || (suite.strategy == StrategyKind::Experimental && c.baseline)
            }
        })
        .map(|cycle| {
            let dir = config::cycle_dir(&suite.name, &cycle.name)?;
            build_job(suite, cycle, &dir, halt)
        })
        .collect()
}

/// Build one job whose journal, checkpoint and artifacts live under `dir`
pub fn build_job(
    suite: &SuiteDefinition,
    cycle: &CycleDefinition,
    dir: &Path,
    halt: &HaltHandle,
) -> Result<CycleJob> {
    let source_spec = suite
        .source_for(cycle)
        .with_context(|| format!("Cycle '{}' has no source", cycle.name))?;
    let decision_spec = suite
        .decision_for(cycle)
        .with_context(|| format!("Cycle '{}' has no decision system", cycle.name))?;

    let mut config = CycleConfig::new(&cycle.name);
    config.instruction = cycle.instruction.clone();
    config.workers = cycle.workers;
    config.retry = cycle.retry.clone();
    config.journal_dir = Some(dir.to_path_buf());
    if cycle.checkpoint.enabled {
        config.checkpoint = Some(CheckpointOptions {
            dir: dir.to_path_buf(),
            store_outcomes: cycle.checkpoint.store_outcomes,
            validate_source: cycle.checkpoint.validate_source,
        });
    }

    let runner = CycleRunner::new(
        config,
        build_source(source_spec, &cycle.checkpoint.key_field),
        build_decision(decision_spec)?,
    )
    .with_row_plugins(cycle.row_plugins.iter().map(build_row_plugin).collect())
    .with_aggregation_plugins(
        cycle
            .aggregation_plugins
            .iter()
            .map(build_aggregation_plugin)
            .collect(),
    )
    .with_halt_conditions(cycle.budget.conditions())
    .with_rate_limiter(cycle.rate_limit.build())
    .with_cost_tracker(cycle.cost.build())
    .with_halt_handle(halt.clone());

    let artifacts_dir = dir.join(ARTIFACTS_DIR);
    let sinks = cycle
        .sinks
        .iter()
        .map(|spec| build_sink(spec, &artifacts_dir))
        .collect::<Result<Vec<_>>>()?;

    let job = CycleJob::new(runner)
        .with_sinks(sinks)
        .with_security_level(cycle.security_level)
        .with_comparison_plugins(
            cycle
                .comparison_plugins
                .iter()
                .map(build_comparison_plugin)
                .collect(),
        );

    Ok(if cycle.baseline { job.as_baseline() } else { job })
}

pub fn build_source(spec: &SourceSpec, key_field: &str) -> Arc<dyn DataSource> {
    match spec {
        SourceSpec::Jsonl { path } => Arc::new(JsonlSource::new(path, key_field)),
    }
}

pub fn build_decision(spec: &DecisionSpec) -> Result<Arc<dyn DecisionSystem>> {
    Ok(match spec {
        DecisionSpec::Echo => Arc::new(EchoDecision),
        DecisionSpec::Command {
            program,
            args,
            timeout_seconds,
        } => Arc::new(CommandDecision::new(
            program,
            args.clone(),
            Duration::from_secs(*timeout_seconds),
        )),
        DecisionSpec::Http {
            url,
            headers,
            timeout_seconds,
        } => Arc::new(
            HttpDecision::new(url, Duration::from_secs(*timeout_seconds))
                .context("Failed to build HTTP client")?
                .with_headers(headers.clone()),
        ),
    })
}

fn build_row_plugin(spec: &RowPluginSpec) -> Arc<dyn RowPlugin> {
    match spec {
        RowPluginSpec::RequireFields { fields } => Arc::new(RequireFields::new(fields.clone())),
        RowPluginSpec::ExtractFields { fields } => Arc::new(ExtractFields::new(fields.clone())),
    }
}

fn build_aggregation_plugin(spec: &AggregationPluginSpec) -> Arc<dyn AggregationPlugin> {
    match spec {
        AggregationPluginSpec::StatusCounts => Arc::new(StatusCounts),
        AggregationPluginSpec::ScoreStats { field } => Arc::new(ScoreStats::new(field)),
    }
}

fn build_comparison_plugin(spec: &ComparisonPluginSpec) -> Arc<dyn BaselineComparisonPlugin> {
    match spec {
        ComparisonPluginSpec::ScoreDelta { field } => Arc::new(ScoreDelta::new(field)),
        ComparisonPluginSpec::SuccessRateDelta => Arc::new(SuccessRateDelta),
    }
}

/// Resolve a sink's output file: relative names land in `artifacts_dir`
fn sink_path(spec: &SinkSpec, artifacts_dir: &Path) -> PathBuf {
    let (file, default_ext) = match spec.kind {
        SinkKind::JsonResults { ref file } => (file, "json"),
        SinkKind::JsonlOutcomes { ref file } => (file, "jsonl"),
        SinkKind::Manifest { ref file } => (file, "manifest.json"),
    };
    match file {
        Some(f) if Path::new(f).is_absolute() => PathBuf::from(f),
        Some(f) => artifacts_dir.join(f),
        None => artifacts_dir.join(format!("{}.{}", spec.name, default_ext)),
    }
}

pub fn build_sink(spec: &SinkSpec, artifacts_dir: &Path) -> Result<Arc<dyn Sink>> {
    let config = FileSinkConfig::new(&spec.name, sink_path(spec, artifacts_dir))
        .with_security_level(spec.security_level)
        .with_alias(spec.alias.clone())
        .with_consumes(
            spec.references()
                .with_context(|| format!("Invalid references on sink '{}'", spec.name))?,
        );

    Ok(match spec.kind {
        SinkKind::JsonResults { .. } => Arc::new(JsonResultsSink::new(config)),
        SinkKind::JsonlOutcomes { .. } => Arc::new(JsonlOutcomesSink::new(config)),
        SinkKind::Manifest { .. } => Arc::new(ManifestSink::new(config)),
    })
}
