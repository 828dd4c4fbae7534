//! Cycle Runner Integration Tests
//!
//! Retry ceilings, journaled retries, resume after interruption, halt drain
//! and result ordering under a worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence::adapters::{DataSource, DecisionSystem};
use cadence::core::clock::Clock;
use cadence::core::halt::{HaltCondition, MaxElapsed, MaxRows};
use cadence::core::plugins::{AggregationPlugin, PluginError, RequireFields, RowPlugin};
use cadence::core::rate_limit::AdaptiveConfig;
use cadence::core::{
    AdaptiveLimiter, CheckpointOptions, CheckpointStore, CycleConfig, CycleError, CycleRunner,
    EventStore, ManualClock, RetryPolicy,
};
use cadence::domain::{
    DecisionError, DecisionRequest, DecisionResponse, EventType, Row, RowKey, RowOutcome,
    RowStatus, Table,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

/// In-memory table with keys "r0".."r{n-1}"
struct MemorySource(usize);

#[async_trait]
impl DataSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self) -> anyhow::Result<Table> {
        Ok(Table::new(
            (0..self.0)
                .map(|i| {
                    let mut data = Map::new();
                    data.insert("n".into(), json!(i));
                    Row::new(format!("r{}", i), data)
                })
                .collect(),
        ))
    }
}

/// Answers with the row's number; fails transiently a scripted number of
/// times per key first
#[derive(Default)]
struct Scripted {
    transient_failures: HashMap<String, u32>,
    seen: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
}

impl Scripted {
    fn failing(key: &str, times: u32) -> Self {
        let mut transient_failures = HashMap::new();
        transient_failures.insert(key.to_string(), times);
        Self {
            transient_failures,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionSystem for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = request.row_key.as_str().to_string();
        let attempt = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let budget = self.transient_failures.get(&key).copied().unwrap_or(0);
        if attempt <= budget {
            return Err(DecisionError::transient(format!("flaky attempt {}", attempt)));
        }
        Ok(DecisionResponse::new(json!({ "n": request.input["n"] })))
    }
}

struct AlwaysTransient(AtomicUsize);

#[async_trait]
impl DecisionSystem for AlwaysTransient {
    fn name(&self) -> &str {
        "always_transient"
    }

    async fn send(&self, _request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(DecisionError::transient("upstream timeout"))
    }
}

fn config(name: &str) -> CycleConfig {
    let mut config = CycleConfig::new(name);
    config.retry = RetryPolicy::immediate(3);
    config
}

fn checkpointed(name: &str, dir: &TempDir) -> CycleConfig {
    let mut config = config(name);
    config.checkpoint = Some(CheckpointOptions {
        dir: dir.path().to_path_buf(),
        store_outcomes: true,
        validate_source: true,
    });
    config
}

#[tokio::test]
async fn test_retry_ceiling() {
    let temp = TempDir::new().unwrap();
    let decision = Arc::new(AlwaysTransient(AtomicUsize::new(0)));
    let mut config = config("ceiling");
    config.retry = RetryPolicy::immediate(4);
    config.journal_dir = Some(temp.path().to_path_buf());

    let result = CycleRunner::new(config, Arc::new(MemorySource(1)), decision.clone())
        .run()
        .await
        .expect("cycle completes despite the failing row");

    assert_eq!(decision.0.load(Ordering::SeqCst), 4);
    let outcome = &result.outcomes[0];
    assert_eq!(outcome.attempts, 4);
    assert!(outcome.error().unwrap().contains("upstream timeout"));
    assert_eq!(result.stats.rows_failed, 1);

    let events = EventStore::open(temp.path()).await.unwrap().replay().await.unwrap();
    let retries = events
        .iter()
        .filter(|e| e.event_type == EventType::RowRetrying)
        .count();
    assert_eq!(retries, 3);
    assert!(events.iter().any(|e| e.event_type == EventType::RowFailed));
}

#[tokio::test]
async fn test_flaky_row_succeeds_with_two_retries_logged() {
    let temp = TempDir::new().unwrap();
    let decision = Arc::new(Scripted::failing("r2", 2));
    let mut config = CycleConfig::new("flaky");
    config.journal_dir = Some(temp.path().to_path_buf());

    // Default backoff, but slept on a simulated clock
    let result = CycleRunner::new(config, Arc::new(MemorySource(5)), decision.clone())
        .with_clock(Arc::new(ManualClock::new()))
        .run()
        .await
        .unwrap();

    assert_eq!(result.stats.rows_succeeded, 5);
    assert!(result.outcomes.iter().all(|o| o.is_success()));
    assert_eq!(result.outcome(&RowKey::new("r2")).unwrap().attempts, 3);
    assert_eq!(decision.calls(), 7);

    let events = EventStore::open(temp.path()).await.unwrap().replay().await.unwrap();
    let retries: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::RowRetrying)
        .collect();
    assert_eq!(retries.len(), 2);
    assert!(retries.iter().all(|e| e.row_key.as_deref() == Some("r2")));
    assert_eq!(retries[0].attempt, Some(1));
    assert_eq!(retries[1].attempt, Some(2));
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let uninterrupted_dir = TempDir::new().unwrap();
    let resumed_dir = TempDir::new().unwrap();

    let uninterrupted = CycleRunner::new(
        checkpointed("resume", &uninterrupted_dir),
        Arc::new(MemorySource(6)),
        Arc::new(Scripted::failing("r1", 1)),
    )
    .run()
    .await
    .unwrap();

    // Interrupt after four finalized rows
    let decision = Arc::new(Scripted::failing("r1", 1));
    let halted = CycleRunner::new(
        checkpointed("resume", &resumed_dir),
        Arc::new(MemorySource(6)),
        decision.clone(),
    )
    .with_halt_conditions(vec![Arc::new(MaxRows(4)) as Arc<dyn HaltCondition>])
    .run()
    .await
    .unwrap();
    assert!(halted.halted.is_some());
    assert_eq!(halted.outcomes.len(), 4);
    assert_eq!(halted.stats.rows_skipped, 2);

    let calls_before = decision.calls();
    let resumed = CycleRunner::new(
        checkpointed("resume", &resumed_dir),
        Arc::new(MemorySource(6)),
        decision.clone(),
    )
    .run()
    .await
    .unwrap();

    // Only the two unfinished rows were decided again
    assert_eq!(decision.calls() - calls_before, 2);
    assert!(resumed.halted.is_none());
    assert_eq!(resumed.outcomes, uninterrupted.outcomes);

    let a = CheckpointStore::open(uninterrupted_dir.path(), true).await.unwrap();
    let b = CheckpointStore::open(resumed_dir.path(), true).await.unwrap();
    assert_eq!(a.load().await.unwrap(), b.load().await.unwrap());
    assert_eq!(b.load().await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_resume_without_stored_outcomes_marks_rows_resumed() {
    let temp = TempDir::new().unwrap();
    let mut config = config("keys-only");
    config.checkpoint = Some(CheckpointOptions {
        dir: temp.path().to_path_buf(),
        store_outcomes: false,
        validate_source: false,
    });

    CycleRunner::new(config.clone(), Arc::new(MemorySource(3)), Arc::new(Scripted::default()))
        .with_halt_conditions(vec![Arc::new(MaxRows(2)) as Arc<dyn HaltCondition>])
        .run()
        .await
        .unwrap();

    let result = CycleRunner::new(config, Arc::new(MemorySource(3)), Arc::new(Scripted::default()))
        .run()
        .await
        .unwrap();

    assert_eq!(result.stats.rows_resumed, 2);
    assert_eq!(result.stats.rows_succeeded, 1);
    assert_eq!(result.outcomes[0].status, RowStatus::Resumed);
    assert_eq!(result.outcomes[0].index, 0);
    assert!(result.outcomes[2].is_success());
}

#[tokio::test]
async fn test_halt_after_three_of_ten() {
    let temp = TempDir::new().unwrap();
    let decision = Arc::new(Scripted::default());

    let result = CycleRunner::new(
        checkpointed("halt", &temp),
        Arc::new(MemorySource(10)),
        decision.clone(),
    )
    .with_halt_conditions(vec![Arc::new(MaxRows(3)) as Arc<dyn HaltCondition>])
    .run()
    .await
    .unwrap();

    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(result.stats.rows_skipped, 7);
    assert_eq!(decision.calls(), 3);
    assert_eq!(result.halted.as_ref().unwrap().condition, "max_rows");

    let store = CheckpointStore::open(temp.path(), true).await.unwrap();
    let recorded = store.load().await.unwrap();
    assert_eq!(recorded.len(), 3);
    for outcome in &result.outcomes {
        assert!(recorded.contains(&outcome.key));
    }
}

#[tokio::test]
async fn test_halt_drains_in_flight_rows() {
    let temp = TempDir::new().unwrap();
    let mut config = checkpointed("drain", &temp);
    config.workers = 4;

    let result = CycleRunner::new(config, Arc::new(MemorySource(10)), Arc::new(Slow::default()))
        .with_halt_conditions(vec![Arc::new(MaxRows(3)) as Arc<dyn HaltCondition>])
        .run()
        .await
        .unwrap();

    // Three finalized, plus whatever was already dispatched
    let processed = result.outcomes.len();
    assert!((3..=6).contains(&processed), "processed {}", processed);
    assert!(result.outcomes.iter().all(|o| o.is_success()));

    let store = CheckpointStore::open(temp.path(), true).await.unwrap();
    assert_eq!(store.load().await.unwrap().len(), processed);
}

/// Sleeps longer for earlier rows so completion order is reversed;
/// tracks peak concurrency
#[derive(Default)]
struct Slow {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl DecisionSystem for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let n = request.input["n"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(n * 4))).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(DecisionResponse::new(json!({ "n": n })))
    }
}

#[tokio::test]
async fn test_pool_restores_table_order() {
    let decision = Arc::new(Slow::default());
    let mut config = config("ordering");
    config.workers = 4;

    let result = CycleRunner::new(config, Arc::new(MemorySource(8)), decision.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 8);
    for (i, outcome) in result.outcomes.iter().enumerate() {
        assert_eq!(outcome.index, i);
        assert_eq!(outcome.key, RowKey::new(format!("r{}", i)));
        assert_eq!(outcome.response(), Some(&json!({ "n": i })));
    }

    let peak = decision.peak.load(Ordering::SeqCst);
    assert!(peak > 1 && peak <= 4, "peak concurrency {}", peak);
}

/// Answers 429 with an absurd Retry-After on each row's first call
#[derive(Default)]
struct Throttled {
    seen: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl DecisionSystem for Throttled {
    fn name(&self) -> &str {
        "throttled"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        let first = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(request.row_key.as_str().to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            return Err(DecisionError::rate_limited(
                "HTTP 429",
                Some(Duration::from_secs(u64::MAX)),
            ));
        }
        Ok(DecisionResponse::new(json!({ "n": request.input["n"] })))
    }
}

#[tokio::test]
async fn test_unbounded_retry_after_is_capped() {
    let clock = Arc::new(ManualClock::new());
    let start = clock.now();
    let limiter = Arc::new(AdaptiveLimiter::with_clock(
        AdaptiveConfig::default(),
        clock.clone(),
    ));

    // Default policy: the longest wait is 30s
    let result = CycleRunner::new(
        CycleConfig::new("throttled"),
        Arc::new(MemorySource(1)),
        Arc::new(Throttled::default()),
    )
    .with_rate_limiter(limiter)
    .with_clock(clock.clone())
    .run()
    .await
    .expect("a provider hint never aborts the cycle");

    let outcome = &result.outcomes[0];
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(clock.now() - start, Duration::from_secs(30));
}

#[tokio::test]
async fn test_elapsed_budget_uses_cycle_clock() {
    let clock = Arc::new(ManualClock::new());
    let decision = Arc::new(Scripted {
        transient_failures: (0..5).map(|i| (format!("r{}", i), 1)).collect(),
        ..Default::default()
    });
    let mut config = CycleConfig::new("elapsed");
    config.workers = 1;
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 60_000,
        max_delay_ms: 60_000,
        backoff_multiplier: 1.0,
        jitter: 0.0,
    };

    let result = CycleRunner::new(config, Arc::new(MemorySource(5)), decision.clone())
        .with_clock(clock.clone())
        .with_halt_conditions(vec![
            Arc::new(MaxElapsed(Duration::from_secs(30))) as Arc<dyn HaltCondition>
        ])
        .run()
        .await
        .unwrap();

    // The first row's 60s backoff already exceeds the budget
    assert_eq!(result.halted.as_ref().unwrap().condition, "max_elapsed");
    assert_eq!(result.outcomes.len(), 1);
    assert!(result.outcomes[0].is_success());
    assert_eq!(result.stats.rows_skipped, 4);
}

/// Omits the label for row "r1"
struct Unlabeled(AtomicUsize);

#[async_trait]
impl DecisionSystem for Unlabeled {
    fn name(&self) -> &str {
        "unlabeled"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        if request.row_key.as_str() == "r1" {
            return Ok(DecisionResponse::new(json!({})));
        }
        Ok(DecisionResponse::new(json!({ "label": "ham" })))
    }
}

#[tokio::test]
async fn test_rejected_row_is_final_without_retry() {
    let temp = TempDir::new().unwrap();
    let decision = Arc::new(Unlabeled(AtomicUsize::new(0)));

    let result = CycleRunner::new(
        checkpointed("rejecting", &temp),
        Arc::new(MemorySource(3)),
        decision.clone(),
    )
    .with_row_plugins(vec![
        Arc::new(RequireFields::new(vec!["label".into()])) as Arc<dyn RowPlugin>
    ])
    .run()
    .await
    .unwrap();

    assert_eq!(decision.0.load(Ordering::SeqCst), 3);
    assert_eq!(result.stats.rows_succeeded, 2);
    assert_eq!(result.stats.rows_failed, 1);

    let rejected = result.outcome(&RowKey::new("r1")).unwrap();
    assert_eq!(rejected.attempts, 1);
    match &rejected.status {
        RowStatus::Failed { error, rejected } => {
            assert!(*rejected);
            assert!(error.contains("label"));
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    let store = CheckpointStore::open(temp.path(), true).await.unwrap();
    assert!(store.load().await.unwrap().contains(&RowKey::new("r1")));
}

struct Exploding;

impl AggregationPlugin for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    fn apply(&self, _outcomes: &[RowOutcome]) -> Result<Value, PluginError> {
        Err(PluginError::new("exploding", "division by zero"))
    }
}

#[tokio::test]
async fn test_aggregation_failure_aborts_cycle() {
    let err = CycleRunner::new(
        config("aggregating"),
        Arc::new(MemorySource(2)),
        Arc::new(Scripted::default()),
    )
    .with_aggregation_plugins(vec![Arc::new(Exploding) as Arc<dyn AggregationPlugin>])
    .run()
    .await
    .unwrap_err();

    match err {
        CycleError::Aggregation(e) => assert!(e.to_string().contains("division by zero")),
        other => panic!("expected an aggregation failure, got {other}"),
    }
}
