//! Domain types for the cadence engine.
//!
//! This module contains the core data structures:
//! - Row / Table: input units and datasets
//! - Decision: requests, responses and classified errors
//! - Outcome: per-row outcomes and the per-cycle result
//! - Artifact: sink outputs, references and security levels
//! - Events / Cycle: the journal and the summary replayed from it

pub mod artifact;
pub mod cycle;
pub mod decision;
pub mod events;
pub mod outcome;
pub mod row;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactDeclaration, ArtifactReference, SecurityLevel};
pub use cycle::{CycleState, CycleSummary, RowState};
pub use decision::{DecisionError, DecisionRequest, DecisionResponse, Usage};
pub use events::{Event, EventType};
pub use outcome::{
    CycleResult, CycleStats, HaltReason, RowOutcome, RowStatus, BASELINE_COMPARISON_KEY,
};
pub use row::{Row, RowKey, Table};
