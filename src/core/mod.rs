//! Core engine logic.
//!
//! This module contains:
//! - Runner: one SENSE -> DECIDE -> ACT-handoff pass over a table
//! - Retry / RateLimit / Cost / Halt: governors applied while deciding
//! - Checkpoint / EventStore: resume state and the per-cycle journal
//! - ArtifactStore / ArtifactPipeline: the sink graph run in the act phase
//! - Suite / Orchestrator: suite definitions and strategies

pub mod artifact_pipeline;
pub mod artifact_store;
pub mod checkpoint;
pub mod clock;
pub mod cost;
pub mod event_store;
pub mod halt;
pub mod orchestrator;
pub mod plugins;
pub mod rate_limit;
pub mod retry;
pub mod runner;
pub mod suite;

// Re-export commonly used types
pub use artifact_pipeline::{ArtifactPipeline, ExecutionPlan};
pub use artifact_store::{ArtifactError, ArtifactStore};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use event_store::EventStore;
pub use halt::{BudgetLimits, HaltCondition, HaltHandle};
pub use orchestrator::{CycleJob, CycleReport, Orchestrator, SuiteError, SuiteResult};
pub use rate_limit::{AdaptiveLimiter, FixedWindowLimiter, RateLimiter};
pub use retry::RetryPolicy;
pub use runner::{CheckpointOptions, CycleConfig, CycleError, CycleRunner};
pub use suite::{CycleDefinition, StrategyKind, SuiteDefinition};
