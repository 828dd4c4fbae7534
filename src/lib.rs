//! cadence - resumable, rate-governed cycle engine
//!
//! Runs a decision system over every row of a table, one *cycle* at a time:
//! SENSE loads the table, DECIDE sends each row through a bounded worker
//! pool with retries, and ACT hands the ordered result to a graph of sinks.
//!
//! # Architecture
//!
//! - Every finalized row is checkpointed, so an interrupted cycle resumes
//!   without repeating work
//! - Every cycle keeps an append-only journal of its events
//! - Rate limiters, cost trackers and halt conditions govern a cycle
//! - Sinks form a DAG of artifacts that never lowers a security level
//!
//! # Modules
//!
//! - `adapters`: Data sources, decision systems and sinks
//! - `core`: Runner, governors, checkpoint, journal, artifact pipeline, orchestrator
//! - `domain`: Data structures (Row, RowOutcome, Artifact, Event)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run every cycle of a suite
//! cadence run suite.yaml
//!
//! # Check a cycle's journal
//! cadence status <suite> <cycle>
//!
//! # Start a cycle over
//! cadence reset <suite> <cycle>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{CycleRunner, Orchestrator, SuiteDefinition};
pub use crate::domain::{CycleResult, Event, EventType, Row, RowKey, RowOutcome, Table};
