//! Rate Limit Integration Tests
//!
//! Ceilings hold across concurrent callers. Time is simulated with a
//! ManualClock, so no test waits for a real window to roll over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cadence::adapters::{DataSource, DecisionSystem};
use cadence::core::clock::Clock;
use cadence::core::rate_limit::{AdaptiveConfig, Feedback, RateLimitSettings};
use cadence::core::{
    AdaptiveLimiter, CycleConfig, CycleRunner, FixedWindowLimiter, ManualClock, RateLimiter,
    RetryPolicy,
};
use cadence::domain::{DecisionError, DecisionRequest, DecisionResponse, Row, Table};
use serde_json::{json, Map};
use tokio::task::JoinSet;

const WINDOW: Duration = Duration::from_secs(10);

async fn acquire_concurrently(limiter: Arc<dyn RateLimiter>, callers: usize) -> Vec<Instant> {
    let mut tasks = JoinSet::new();
    for _ in 0..callers {
        let limiter = limiter.clone();
        tasks.spawn(async move { limiter.acquire(1).await.unwrap().granted_at });
    }

    let mut granted = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        granted.push(joined.unwrap());
    }
    granted
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_window_ceiling_across_callers() {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(FixedWindowLimiter::with_clock(5, WINDOW, clock.clone()));

    let granted = acquire_concurrently(limiter.clone(), 23).await;
    assert_eq!(granted.len(), 23);

    let mut per_window: HashMap<u128, usize> = HashMap::new();
    for at in &granted {
        *per_window.entry(limiter.window_index(*at)).or_default() += 1;
    }
    assert!(per_window.values().all(|&n| n <= 5), "{:?}", per_window);
    // 23 permits at 5 per window need at least 5 windows
    assert!(per_window.len() >= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_adaptive_sliding_ceiling_across_callers() {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(AdaptiveLimiter::with_clock(
        AdaptiveConfig {
            max_requests: 4,
            window: WINDOW,
            ..Default::default()
        },
        clock.clone(),
    ));

    let mut granted = acquire_concurrently(limiter.clone(), 17).await;
    granted.sort();

    // No sliding window of WINDOW length holds more than the ceiling
    for (i, start) in granted.iter().enumerate() {
        let in_window = granted[i..]
            .iter()
            .take_while(|at| at.duration_since(*start) < WINDOW)
            .count();
        assert!(in_window <= 4, "{} permits within one window", in_window);
    }
}

#[tokio::test]
async fn test_adaptive_backpressure_lowers_concurrent_ceiling() {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(AdaptiveLimiter::with_clock(
        AdaptiveConfig {
            max_requests: 8,
            window: WINDOW,
            decrease_factor: 0.5,
            ..Default::default()
        },
        clock.clone(),
    ));

    limiter.feedback(Feedback::Backpressure { retry_after: None });
    assert_eq!(limiter.ceiling(), 4);

    let start = clock.now();
    let granted = acquire_concurrently(limiter.clone(), 4).await;
    assert!(granted.iter().all(|at| *at == start));

    // The fifth caller must wait for the window to slide
    let fifth = limiter.acquire(1).await.unwrap();
    assert!(fifth.granted_at >= start + WINDOW);
}

/// Records the simulated time of every call it receives
struct Stamping {
    clock: Arc<ManualClock>,
    calls: Mutex<Vec<Instant>>,
}

#[async_trait]
impl DecisionSystem for Stamping {
    fn name(&self) -> &str {
        "stamping"
    }

    async fn send(&self, _request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        self.calls.lock().unwrap().push(self.clock.now());
        Ok(DecisionResponse::new(json!({})))
    }
}

struct Rows(usize);

#[async_trait]
impl DataSource for Rows {
    fn name(&self) -> &str {
        "rows"
    }

    async fn load(&self) -> anyhow::Result<Table> {
        Ok(Table::new(
            (0..self.0)
                .map(|i| Row::new(format!("row-{}", i), Map::new()))
                .collect(),
        ))
    }
}

#[tokio::test]
async fn test_runner_respects_fixed_window() {
    let clock = Arc::new(ManualClock::new());
    let origin = clock.now();
    let settings: RateLimitSettings = serde_yaml::from_str(
        "kind: fixed_window\nrequests: 3\nwindow_seconds: 10\n",
    )
    .unwrap();

    let decision = Arc::new(Stamping {
        clock: clock.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let mut config = CycleConfig::new("governed");
    config.workers = 4;
    config.retry = RetryPolicy::immediate(1);

    let result = CycleRunner::new(config, Arc::new(Rows(10)), decision.clone())
        .with_rate_limiter(settings.build_with_clock(clock.clone()))
        .run()
        .await
        .unwrap();
    assert_eq!(result.stats.rows_succeeded, 10);

    let calls = decision.calls.lock().unwrap();
    let mut per_window: HashMap<u128, usize> = HashMap::new();
    for at in calls.iter() {
        let index = at.duration_since(origin).as_nanos() / WINDOW.as_nanos();
        *per_window.entry(index).or_default() += 1;
    }
    assert!(per_window.values().all(|&n| n <= 3), "{:?}", per_window);
}
