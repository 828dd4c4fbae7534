//! Registry of artifacts produced during one cycle's act phase.
//!
//! Lookups go by id, alias or type. A lookup that matches more than one
//! artifact is an error; the store never picks a candidate for the caller.

use thiserror::Error;

use crate::domain::{Artifact, ArtifactReference, SecurityLevel};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArtifactError {
    #[error("No artifact matches '{0}'")]
    NotFound(String),

    #[error("Ambiguous artifact reference '{reference}': matches {}", candidates.join(", "))]
    Ambiguous {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("Artifact '{0}' is already registered")]
    DuplicateId(String),

    #[error("Sink '{0}' is declared more than once")]
    DuplicateSink(String),

    #[error("Sink '{sink}' consumes '{reference}', which no sink produces")]
    Unresolved { sink: String, reference: String },

    #[error("Sink dependency cycle among: {}", sinks.join(", "))]
    Cycle { sinks: Vec<String> },

    #[error("Security violation in sink '{sink}': {subject} is {declared} but must be at least {required}")]
    SecurityViolation {
        sink: String,
        subject: String,
        declared: SecurityLevel,
        required: SecurityLevel,
    },

    #[error("Sink '{sink}' produced undeclared artifact '{name}'")]
    Undeclared { sink: String, name: String },

    #[error("Sink '{sink}' did not produce declared artifact '{name}'")]
    MissingOutput { sink: String, name: String },

    #[error("Sink '{sink}' failed: {message}")]
    SinkFailed { sink: String, message: String },
}

/// Artifacts of one act phase, in registration order
#[derive(Debug, Default)]
pub struct ArtifactStore {
    artifacts: Vec<Artifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact. Ids are unique within the store.
    pub fn register(&mut self, artifact: Artifact) -> Result<(), ArtifactError> {
        if self.get(&artifact.id).is_some() {
            return Err(ArtifactError::DuplicateId(artifact.id));
        }
        self.artifacts.push(artifact);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.id == id)
    }

    /// Find exactly one artifact for a reference
    pub fn resolve(&self, reference: &ArtifactReference) -> Result<&Artifact, ArtifactError> {
        let mut matches = self.artifacts.iter().filter(|a| a.matches(reference));

        let first = matches
            .next()
            .ok_or_else(|| ArtifactError::NotFound(reference.to_string()))?;

        let rest: Vec<&Artifact> = matches.collect();
        if rest.is_empty() {
            return Ok(first);
        }

        let candidates = std::iter::once(first)
            .chain(rest)
            .map(|a| a.id.clone())
            .collect();
        Err(ArtifactError::Ambiguous {
            reference: reference.to_string(),
            candidates,
        })
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn into_artifacts(self) -> Vec<Artifact> {
        self.artifacts
    }
}
