//! Rate limiters gating calls to the decision system.
//!
//! Limiters are shared by every worker of a cycle. State lives behind a
//! mutex that is never held across an await; callers that cannot be admitted
//! sleep (through the [`Clock`]) until capacity frees up and then re-check.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};

/// Proof that a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub granted_at: Instant,
    pub tokens: u64,
}

/// Provider feedback used by adaptive limiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Success,
    /// Provider asked us to slow down (429 or equivalent)
    Backpressure { retry_after: Option<Duration> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("request of {requested} tokens can never fit the limit of {capacity} tokens per window")]
    ExceedsCapacity { requested: u64, capacity: u64 },
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn name(&self) -> &str;

    /// Wait until a call with the given estimated token cost is permitted
    async fn acquire(&self, estimated_tokens: u64) -> Result<Permit, RateLimitError>;

    /// Report how the provider responded to an admitted call
    fn feedback(&self, _feedback: Feedback) {}
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Admits everything immediately
#[derive(Debug, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    fn name(&self) -> &str {
        "none"
    }

    async fn acquire(&self, estimated_tokens: u64) -> Result<Permit, RateLimitError> {
        Ok(Permit {
            granted_at: Instant::now(),
            tokens: estimated_tokens,
        })
    }
}

// ============================================================================
// Fixed window
// ============================================================================

#[derive(Debug)]
struct WindowState {
    index: u128,
    requests: u64,
    tokens: u64,
}

/// Allows `max_requests` (and optionally `max_tokens`) per wall-clock window.
///
/// Windows are aligned to the instant the limiter was created. Once a window
/// is exhausted, callers block until it rolls over.
pub struct FixedWindowLimiter {
    max_requests: u64,
    max_tokens: Option<u64>,
    window: Duration,
    origin: Instant,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self::with_clock(max_requests, window, Arc::new(SystemClock))
    }

    pub fn with_clock(max_requests: u64, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now();
        Self {
            max_requests: max_requests.max(1),
            max_tokens: None,
            window: window.max(Duration::from_millis(1)),
            origin,
            clock,
            state: Mutex::new(WindowState {
                index: 0,
                requests: 0,
                tokens: 0,
            }),
        }
    }

    pub fn with_token_limit(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window a given instant falls into, counted from the limiter's origin
    pub fn window_index(&self, at: Instant) -> u128 {
        at.saturating_duration_since(self.origin).as_nanos() / self.window.as_nanos()
    }

    /// Try to admit now. Returns the time to wait until the next window otherwise.
    fn try_admit(&self, tokens: u64) -> Result<Permit, Duration> {
        // Read the clock under the lock so admissions are ordered by time
        let mut state = lock(&self.state);
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let window_ns = self.window.as_nanos();
        let index = elapsed / window_ns;

        if index != state.index {
            state.index = index;
            state.requests = 0;
            state.tokens = 0;
        }

        let tokens_fit = self
            .max_tokens
            .map_or(true, |max| state.tokens + tokens <= max);
        if state.requests < self.max_requests && tokens_fit {
            state.requests += 1;
            state.tokens += tokens;
            return Ok(Permit {
                granted_at: now,
                tokens,
            });
        }

        let until_rollover = (index + 1) * window_ns - elapsed;
        Err(Duration::from_nanos(until_rollover.min(u64::MAX as u128) as u64))
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn name(&self) -> &str {
        "fixed_window"
    }

    async fn acquire(&self, estimated_tokens: u64) -> Result<Permit, RateLimitError> {
        if let Some(max) = self.max_tokens {
            if estimated_tokens > max {
                return Err(RateLimitError::ExceedsCapacity {
                    requested: estimated_tokens,
                    capacity: max,
                });
            }
        }

        loop {
            match self.try_admit(estimated_tokens) {
                Ok(permit) => return Ok(permit),
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate window exhausted, waiting");
                    self.clock.sleep(wait).await;
                }
            }
        }
    }
}

// ============================================================================
// Adaptive sliding window
// ============================================================================

/// Tuning for [`AdaptiveLimiter`]
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Configured ceiling; the effective ceiling never exceeds it
    pub max_requests: u64,
    pub max_tokens: Option<u64>,
    pub window: Duration,
    /// Floor the effective ceiling shrinks to
    pub min_requests: u64,
    /// Multiplier applied to the ceiling on backpressure
    pub decrease_factor: f64,
    /// Consecutive successes needed to grow the ceiling by one
    pub increase_after: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            max_tokens: None,
            window: Duration::from_secs(60),
            min_requests: 1,
            decrease_factor: 0.5,
            increase_after: 10,
        }
    }
}

#[derive(Debug)]
struct AdaptiveState {
    recent: VecDeque<(Instant, u64)>,
    ceiling: u64,
    success_streak: u32,
    paused_until: Option<Instant>,
}

/// Sliding-window limiter whose ceiling reacts to provider feedback.
///
/// Backpressure shrinks the ceiling multiplicatively (down to
/// `min_requests`); runs of successes grow it back one step at a time.
pub struct AdaptiveLimiter {
    config: AdaptiveConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(mut config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        config.max_requests = config.max_requests.max(1);
        config.min_requests = config.min_requests.clamp(1, config.max_requests);
        config.window = config.window.max(Duration::from_millis(1));
        let ceiling = config.max_requests;
        Self {
            config,
            clock,
            state: Mutex::new(AdaptiveState {
                recent: VecDeque::new(),
                ceiling,
                success_streak: 0,
                paused_until: None,
            }),
        }
    }

    /// Current effective ceiling
    pub fn ceiling(&self) -> u64 {
        lock(&self.state).ceiling
    }

    fn try_admit(&self, tokens: u64) -> Result<Permit, Duration> {
        let mut state = lock(&self.state);
        let now = self.clock.now();
        let window = self.config.window;

        while let Some(&(at, _)) = state.recent.front() {
            if at + window <= now {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        if let Some(until) = state.paused_until {
            if until > now {
                return Err(until - now);
            }
            state.paused_until = None;
        }

        let used_tokens: u64 = state.recent.iter().map(|(_, t)| t).sum();
        let tokens_fit = self
            .config
            .max_tokens
            .map_or(true, |max| used_tokens + tokens <= max);

        if (state.recent.len() as u64) < state.ceiling && tokens_fit {
            state.recent.push_back((now, tokens));
            return Ok(Permit {
                granted_at: now,
                tokens,
            });
        }

        let wait = state
            .recent
            .front()
            .map(|&(at, _)| (at + window).saturating_duration_since(now))
            .unwrap_or(window);
        Err(wait.max(Duration::from_millis(1)))
    }
}

#[async_trait]
impl RateLimiter for AdaptiveLimiter {
    fn name(&self) -> &str {
        "adaptive"
    }

    async fn acquire(&self, estimated_tokens: u64) -> Result<Permit, RateLimitError> {
        if let Some(max) = self.config.max_tokens {
            if estimated_tokens > max {
                return Err(RateLimitError::ExceedsCapacity {
                    requested: estimated_tokens,
                    capacity: max,
                });
            }
        }

        loop {
            match self.try_admit(estimated_tokens) {
                Ok(permit) => return Ok(permit),
                Err(wait) => self.clock.sleep(wait).await,
            }
        }
    }

    fn feedback(&self, feedback: Feedback) {
        let mut state = lock(&self.state);
        match feedback {
            Feedback::Success => {
                state.success_streak += 1;
                if state.success_streak >= self.config.increase_after
                    && state.ceiling < self.config.max_requests
                {
                    state.ceiling += 1;
                    state.success_streak = 0;
                    debug!(ceiling = state.ceiling, "Adaptive limiter ceiling raised");
                }
            }
            Feedback::Backpressure { retry_after } => {
                let shrunk = (state.ceiling as f64 * self.config.decrease_factor).floor() as u64;
                state.ceiling = shrunk.clamp(self.config.min_requests, self.config.max_requests);
                state.success_streak = 0;
                if let Some(delay) = retry_after {
                    // Provider-supplied; an unrepresentable pause falls back to one window
                    let now = self.clock.now();
                    state.paused_until = now
                        .checked_add(delay)
                        .or_else(|| now.checked_add(self.config.window));
                }
                warn!(
                    ceiling = state.ceiling,
                    retry_after_ms = retry_after.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                    "Provider backpressure, adaptive limiter ceiling lowered"
                );
            }
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

fn default_window_seconds() -> u64 {
    60
}
fn default_min_requests() -> u64 {
    1
}
fn default_decrease_factor() -> f64 {
    0.5
}
fn default_increase_after() -> u32 {
    10
}

/// Rate-limit settings as written in a suite definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitSettings {
    #[default]
    None,

    FixedWindow {
        requests: u64,
        #[serde(default)]
        tokens: Option<u64>,
        #[serde(default = "default_window_seconds")]
        window_seconds: u64,
    },

    Adaptive {
        requests: u64,
        #[serde(default)]
        tokens: Option<u64>,
        #[serde(default = "default_window_seconds")]
        window_seconds: u64,
        #[serde(default = "default_min_requests")]
        min_requests: u64,
        #[serde(default = "default_decrease_factor")]
        decrease_factor: f64,
        #[serde(default = "default_increase_after")]
        increase_after: u32,
    },
}

impl RateLimitSettings {
    pub fn build(&self) -> Arc<dyn RateLimiter> {
        self.build_with_clock(Arc::new(SystemClock))
    }

    pub fn build_with_clock(&self, clock: Arc<dyn Clock>) -> Arc<dyn RateLimiter> {
        match self {
            Self::None => Arc::new(NoopRateLimiter),
            Self::FixedWindow {
                requests,
                tokens,
                window_seconds,
            } => {
                let limiter = FixedWindowLimiter::with_clock(
                    *requests,
                    Duration::from_secs(*window_seconds),
                    clock,
                );
                match tokens {
                    Some(t) => Arc::new(limiter.with_token_limit(*t)),
                    None => Arc::new(limiter),
                }
            }
            Self::Adaptive {
                requests,
                tokens,
                window_seconds,
                min_requests,
                decrease_factor,
                increase_after,
            } => Arc::new(AdaptiveLimiter::with_clock(
                AdaptiveConfig {
                    max_requests: *requests,
                    max_tokens: *tokens,
                    window: Duration::from_secs(*window_seconds),
                    min_requests: *min_requests,
                    decrease_factor: *decrease_factor,
                    increase_after: *increase_after,
                },
                clock,
            )),
        }
    }
}
