//! Cycle runner: one SENSE -> DECIDE -> ACT-handoff pass over a table.
//!
//! - SENSE loads the table and drops rows the checkpoint already holds
//! - DECIDE dispatches rows in table order to a bounded pool of workers
//! - each finalized outcome is checkpointed, then halt conditions run
//! - the handoff restores table order and runs aggregation plugins
//!
//! Writing to sinks is not done here; see [`super::artifact_pipeline`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{DataSource, DecisionSystem};
use crate::domain::{
    CycleResult, CycleStats, DecisionError, DecisionRequest, Event, EventType, HaltReason, Row,
    RowKey, RowOutcome, RowStatus,
};

use super::artifact_pipeline::ArtifactError;
use super::checkpoint::{CheckpointEntry, CheckpointError, CheckpointStore};
use super::clock::{Clock, SystemClock};
use super::cost::{CostTracker, NoopCostTracker};
use super::event_store::EventStore;
use super::halt::{BudgetState, HaltCondition, HaltHandle};
use super::plugins::{apply_row_plugins, AggregationPlugin, PluginError, RowPlugin};
use super::rate_limit::{Feedback, NoopRateLimiter, RateLimiter};
use super::retry::RetryPolicy;

/// Errors that abort a whole cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Failed to load source table: {0:#}")]
    SourceLoad(anyhow::Error),

    #[error("Duplicate row key '{0}' in source table")]
    DuplicateKey(RowKey),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Aggregation failed: {0}")]
    Aggregation(#[source] PluginError),

    #[error("Baseline comparison failed: {0}")]
    Comparison(#[source] PluginError),

    #[error("Failed to open cycle journal: {0:#}")]
    Journal(anyhow::Error),

    #[error("Act phase failed: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Row worker crashed: {0}")]
    Worker(String),
}

/// Where and how a cycle checkpoints
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointOptions {
    pub dir: PathBuf,

    /// Keep each row's outcome alongside its key
    pub store_outcomes: bool,

    /// Refuse to resume when the table no longer matches the manifest
    pub validate_source: bool,
}

/// Resolved settings for one cycle
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub name: String,

    /// Static instruction compiled into every request
    pub instruction: String,

    /// Size of the worker pool (1 = sequential)
    pub workers: usize,

    pub retry: RetryPolicy,

    pub checkpoint: Option<CheckpointOptions>,

    /// Directory for `events.jsonl`; no journal when unset
    pub journal_dir: Option<PathBuf>,
}

impl CycleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: String::new(),
            workers: 1,
            retry: RetryPolicy::default(),
            checkpoint: None,
            journal_dir: None,
        }
    }
}

/// Executes one cycle with its collaborators and governors
pub struct CycleRunner {
    config: CycleConfig,
    source: Arc<dyn DataSource>,
    decision: Arc<dyn DecisionSystem>,
    row_plugins: Vec<Arc<dyn RowPlugin>>,
    aggregation_plugins: Vec<Arc<dyn AggregationPlugin>>,
    halt_conditions: Vec<Arc<dyn HaltCondition>>,
    rate_limiter: Arc<dyn RateLimiter>,
    cost_tracker: Arc<dyn CostTracker>,
    clock: Arc<dyn Clock>,
    halt: HaltHandle,
}

impl CycleRunner {
    pub fn new(
        config: CycleConfig,
        source: Arc<dyn DataSource>,
        decision: Arc<dyn DecisionSystem>,
    ) -> Self {
        Self {
            config,
            source,
            decision,
            row_plugins: Vec::new(),
            aggregation_plugins: Vec::new(),
            halt_conditions: Vec::new(),
            rate_limiter: Arc::new(NoopRateLimiter),
            cost_tracker: Arc::new(NoopCostTracker),
            clock: Arc::new(SystemClock),
            halt: HaltHandle::new(),
        }
    }

    pub fn with_row_plugins(mut self, plugins: Vec<Arc<dyn RowPlugin>>) -> Self {
        self.row_plugins = plugins;
        self
    }

    pub fn with_aggregation_plugins(mut self, plugins: Vec<Arc<dyn AggregationPlugin>>) -> Self {
        self.aggregation_plugins = plugins;
        self
    }

    pub fn with_halt_conditions(mut self, conditions: Vec<Arc<dyn HaltCondition>>) -> Self {
        self.halt_conditions = conditions;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_cost_tracker(mut self, tracker: Arc<dyn CostTracker>) -> Self {
        self.cost_tracker = tracker;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_halt_handle(mut self, halt: HaltHandle) -> Self {
        self.halt = halt;
        self
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn aggregation_plugin_names(&self) -> impl Iterator<Item = &str> {
        self.aggregation_plugins.iter().map(|p| p.name())
    }

    /// Run the cycle to completion or to a halt signal
    #[instrument(skip(self), fields(cycle = %self.config.name))]
    pub async fn run(&self) -> Result<CycleResult, CycleError> {
        let execution_id = Uuid::new_v4();

        let journal = match &self.config.journal_dir {
            Some(dir) => Some(Arc::new(
                EventStore::open(dir).await.map_err(CycleError::Journal)?,
            )),
            None => None,
        };

        let result = self.execute(execution_id, journal.clone()).await;

        if let Err(ref e) = result {
            error!(error = %e, "Cycle failed");
            let event = Event::new(
                execution_id,
                &self.config.name,
                EventType::CycleFailed,
                format!("Cycle '{}' failed", self.config.name),
            )
            .with_error(e.to_string());
            journal_event(journal.as_deref(), &event).await;
        }

        result
    }

    async fn execute(
        &self,
        execution_id: Uuid,
        journal: Option<Arc<EventStore>>,
    ) -> Result<CycleResult, CycleError> {
        let started_at = Utc::now();
        let name = &self.config.name;

        // ==========================================================
        // SENSE
        // ==========================================================

        let table = self.source.load().await.map_err(CycleError::SourceLoad)?;
        if let Some(dup) = table.first_duplicate_key() {
            return Err(CycleError::DuplicateKey(dup.clone()));
        }

        let checkpoint = match &self.config.checkpoint {
            Some(opts) => Some(CheckpointStore::open(&opts.dir, opts.store_outcomes).await?),
            None => None,
        };

        let mut prior: HashMap<RowKey, CheckpointEntry> = HashMap::new();
        if let (Some(store), Some(opts)) = (&checkpoint, &self.config.checkpoint) {
            store.verify_source(&table, opts.validate_source).await?;
            prior = store.load_entries().await?;

            let present: HashSet<&RowKey> = table.rows.iter().map(|r| &r.key).collect();
            let stale = prior.keys().filter(|k| !present.contains(k)).count();
            if stale > 0 {
                warn!(stale, "Checkpoint holds keys no longer in the source table; ignoring them");
            }
        }

        let rows_total = table.len();
        let mut slots: Vec<Option<RowOutcome>> = vec![None; rows_total];
        let mut pending: Vec<(usize, Row)> = Vec::new();

        for (index, row) in table.rows.into_iter().enumerate() {
            match prior.remove(&row.key) {
                Some(entry) => {
                    slots[index] = Some(match entry.outcome {
                        Some(outcome) => RowOutcome { index, ..outcome },
                        None => RowOutcome::resumed(row.key, index),
                    });
                }
                None => pending.push((index, row)),
            }
        }

        let resumed = rows_total - pending.len();
        info!(rows = rows_total, resumed, pending = pending.len(), "Cycle started");
        journal_event(
            journal.as_deref(),
            &Event::new(
                execution_id,
                name,
                EventType::CycleStarted,
                format!(
                    "Cycle '{}' started: {} rows, {} already checkpointed",
                    name, rows_total, resumed
                ),
            ),
        )
        .await;

        // ==========================================================
        // DECIDE
        // ==========================================================

        let worker = Arc::new(RowWorker {
            cycle: name.clone(),
            instruction: self.config.instruction.clone(),
            execution_id,
            retry: self.config.retry.clone(),
            decision: self.decision.clone(),
            row_plugins: self.row_plugins.clone(),
            rate_limiter: self.rate_limiter.clone(),
            cost_tracker: self.cost_tracker.clone(),
            clock: self.clock.clone(),
            journal: journal.clone(),
        });

        let pool_size = self.config.workers.max(1);
        let mut queue = pending.into_iter();
        let mut in_flight: JoinSet<RowOutcome> = JoinSet::new();
        let mut budget = BudgetState::new(self.clock.now());
        let mut halted: Option<HaltReason> = None;

        loop {
            // Fill the pool in table order
            while halted.is_none() && in_flight.len() < pool_size {
                if self.halt.is_requested() {
                    halted = Some(self.request_halt(
                        execution_id,
                        journal.as_deref(),
                        "interrupt",
                        "Interrupted by external halt request".to_string(),
                    ).await);
                    break;
                }
                let Some((index, row)) = queue.next() else {
                    break;
                };
                let worker = worker.clone();
                in_flight.spawn(async move { worker.process(index, row).await });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome = joined.map_err(|e| CycleError::Worker(e.to_string()))?;

            if let Some(store) = &checkpoint {
                store.record(&outcome).await?;
            }

            budget.rows_processed += 1;
            if outcome.is_success() {
                budget.rows_succeeded += 1;
            } else if outcome.is_failure() {
                budget.rows_failed += 1;
            }
            budget.cost = self.cost_tracker.snapshot();
            budget.now = self.clock.now();

            let index = outcome.index;
            slots[index] = Some(outcome);

            if halted.is_none() {
                if let Some(condition) = self.halt_conditions.iter().find(|c| c.check(&budget)) {
                    let message = condition.describe(&budget);
                    halted = Some(
                        self.request_halt(execution_id, journal.as_deref(), condition.name(), message)
                            .await,
                    );
                }
            }
        }

        // ==========================================================
        // ACT handoff
        // ==========================================================

        let outcomes: Vec<RowOutcome> = slots.into_iter().flatten().collect();

        let mut aggregates = BTreeMap::new();
        for plugin in &self.aggregation_plugins {
            let value = plugin.apply(&outcomes).map_err(CycleError::Aggregation)?;
            aggregates.insert(plugin.name().to_string(), value);
        }

        let mut stats = CycleStats {
            rows_total,
            rows_skipped: rows_total - outcomes.len(),
            cost_usd: budget.cost.cost_usd,
            tokens: budget.cost.total_tokens(),
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                RowStatus::Succeeded { .. } => stats.rows_succeeded += 1,
                RowStatus::Failed { .. } => stats.rows_failed += 1,
                RowStatus::Resumed => stats.rows_resumed += 1,
            }
        }

        info!(
            succeeded = stats.rows_succeeded,
            failed = stats.rows_failed,
            resumed = stats.rows_resumed,
            skipped = stats.rows_skipped,
            "Cycle completed"
        );
        journal_event(
            journal.as_deref(),
            &Event::new(
                execution_id,
                name,
                EventType::CycleCompleted,
                format!(
                    "Cycle '{}' completed: {} succeeded, {} failed, {} skipped",
                    name, stats.rows_succeeded, stats.rows_failed, stats.rows_skipped
                ),
            ),
        )
        .await;

        Ok(CycleResult {
            cycle: name.clone(),
            outcomes,
            aggregates,
            halted,
            stats,
            started_at,
            completed_at: Utc::now(),
        })
    }

    async fn request_halt(
        &self,
        execution_id: Uuid,
        journal: Option<&EventStore>,
        condition: &str,
        message: String,
    ) -> HaltReason {
        info!(condition, %message, "Halting dispatch; draining in-flight rows");
        journal_event(
            journal,
            &Event::new(execution_id, &self.config.name, EventType::HaltRequested, &message),
        )
        .await;
        HaltReason {
            condition: condition.to_string(),
            message,
        }
    }
}

/// Everything a spawned row task needs, shared across the pool
struct RowWorker {
    cycle: String,
    instruction: String,
    execution_id: Uuid,
    retry: RetryPolicy,
    decision: Arc<dyn DecisionSystem>,
    row_plugins: Vec<Arc<dyn RowPlugin>>,
    rate_limiter: Arc<dyn RateLimiter>,
    cost_tracker: Arc<dyn CostTracker>,
    clock: Arc<dyn Clock>,
    journal: Option<Arc<EventStore>>,
}

impl RowWorker {
    /// Drive one row to a final outcome. Never fails; errors become outcomes.
    async fn process(&self, index: usize, row: Row) -> RowOutcome {
        let request = DecisionRequest::compile(&self.cycle, &self.instruction, &row);
        let key = row.key.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.journal(
                Event::new(
                    self.execution_id,
                    &self.cycle,
                    EventType::RowStarted,
                    format!("Row '{}' attempt {}", key, attempt),
                )
                .with_row(key.as_str(), attempt),
            )
            .await;

            let attempt_start = Instant::now();

            if let Err(e) = self.rate_limiter.acquire(request.estimated_tokens).await {
                return self
                    .fail(RowOutcome::failed(key, index, attempt, e.to_string()), attempt_start)
                    .await;
            }

            let result = self.decision.send(&request).await;

            match result {
                Ok(response) => {
                    self.rate_limiter.feedback(Feedback::Success);
                    self.cost_tracker.record(&response.usage);

                    let outcome = match apply_row_plugins(&self.row_plugins, &row, &response) {
                        Ok(metrics) => {
                            RowOutcome::succeeded(key, index, attempt, response.content, metrics)
                        }
                        Err(e) => {
                            return self
                                .fail(
                                    RowOutcome::rejected(key, index, attempt, e.to_string()),
                                    attempt_start,
                                )
                                .await;
                        }
                    };

                    let duration_ms = attempt_start.elapsed().as_millis() as u64;
                    debug!(row = %outcome.key, attempt, duration_ms, "Row completed");
                    self.journal(
                        Event::new(
                            self.execution_id,
                            &self.cycle,
                            EventType::RowCompleted,
                            format!("Row '{}' completed in {}ms", outcome.key, duration_ms),
                        )
                        .with_row(outcome.key.as_str(), attempt)
                        .with_duration(duration_ms),
                    )
                    .await;
                    return outcome;
                }
                Err(e) => {
                    // Provider hints are capped by the policy's longest delay
                    let retry_after = e.retry_after().map(|d| d.min(self.retry.max_delay()));
                    if matches!(e, DecisionError::RateLimited { .. }) {
                        self.rate_limiter
                            .feedback(Feedback::Backpressure { retry_after });
                    }

                    if e.is_transient() && self.retry.should_retry(attempt) {
                        let delay =
                            retry_after.unwrap_or_else(|| self.retry.delay_for_attempt(attempt));

                        self.journal(
                            Event::new(
                                self.execution_id,
                                &self.cycle,
                                EventType::RowRetrying,
                                format!("Row '{}' failed, retrying in {:?}", key, delay),
                            )
                            .with_row(key.as_str(), attempt)
                            .with_error(e.to_string()),
                        )
                        .await;

                        warn!(
                            row = %key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Row failed, retrying"
                        );

                        self.clock.sleep(delay).await;
                        continue;
                    }

                    return self
                        .fail(RowOutcome::failed(key, index, attempt, e.to_string()), attempt_start)
                        .await;
                }
            }
        }
    }

    async fn fail(&self, outcome: RowOutcome, attempt_start: Instant) -> RowOutcome {
        let duration_ms = attempt_start.elapsed().as_millis() as u64;
        let error = outcome.error().unwrap_or_default().to_string();

        warn!(
            row = %outcome.key,
            attempt = outcome.attempts,
            error = %error,
            "Row failed permanently"
        );
        self.journal(
            Event::new(
                self.execution_id,
                &self.cycle,
                EventType::RowFailed,
                format!(
                    "Row '{}' failed after {} attempts",
                    outcome.key, outcome.attempts
                ),
            )
            .with_row(outcome.key.as_str(), outcome.attempts)
            .with_duration(duration_ms)
            .with_error(error),
        )
        .await;
        outcome
    }

    async fn journal(&self, event: Event) {
        journal_event(self.journal.as_deref(), &event).await;
    }
}

/// Journal writes are best-effort; a failed append is logged, not fatal
async fn journal_event(journal: Option<&EventStore>, event: &Event) {
    if let Some(store) = journal {
        if let Err(e) = store.append(event).await {
            warn!(error = %e, event = ?event.event_type, "Failed to append journal event");
        }
    }
}
