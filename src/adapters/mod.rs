//! Interfaces to the systems a cycle talks to, plus built-in adapters.
//!
//! - [`DataSource`] supplies the table a cycle iterates
//! - [`DecisionSystem`] answers one request per row and classifies its own failures
//! - [`Sink`] writes the cycle result during the act phase

pub mod command;
pub mod echo;
pub mod http;
pub mod jsonl;
pub mod sinks;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{
    Artifact, ArtifactDeclaration, ArtifactReference, CycleResult, DecisionError,
    DecisionRequest, DecisionResponse, SecurityLevel, Table,
};

pub use command::CommandDecision;
pub use echo::EchoDecision;
pub use http::HttpDecision;
pub use jsonl::JsonlSource;
pub use sinks::{JsonResultsSink, JsonlOutcomesSink, ManifestSink};

/// Supplies the initial table for a cycle
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Load every row. Any error is fatal to the cycle.
    async fn load(&self) -> Result<Table>;
}

/// Turns a request into a response, or a classified failure
#[async_trait]
pub trait DecisionSystem: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError>;
}

/// What a sink receives when it runs
#[derive(Debug, Clone, Copy)]
pub struct SinkInput<'a> {
    pub result: &'a CycleResult,

    /// Artifacts resolved from the sink's `consumes()`, in declaration order
    pub consumed: &'a [Artifact],
}

/// One artifact returned by [`Sink::write`]; `name` must match a declaration
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArtifact {
    pub name: String,
    pub payload: Value,
}

impl ProducedArtifact {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// An output target driven by the artifact pipeline
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn produces(&self) -> Vec<ArtifactDeclaration> {
        Vec::new()
    }

    fn consumes(&self) -> Vec<ArtifactReference> {
        Vec::new()
    }

    /// Highest classification this sink may hold
    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Public
    }

    async fn write(&self, input: SinkInput<'_>) -> Result<Vec<ProducedArtifact>>;
}

/// Interpret a decision system's JSON reply.
///
/// An object with a `content` field is read as a full response (content
/// plus optional `usage`); anything else is taken as the content itself.
pub(crate) fn parse_response(value: Value) -> DecisionResponse {
    if value.get("content").is_some() {
        if let Ok(response) = serde_json::from_value::<DecisionResponse>(value.clone()) {
            return response;
        }
    }
    DecisionResponse::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope() {
        let response = parse_response(json!({
            "content": {"label": "spam"},
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        }));
        assert_eq!(response.content, json!({"label": "spam"}));
        assert_eq!(response.usage.total_tokens(), 12);
    }

    #[test]
    fn test_parse_bare_value() {
        let response = parse_response(json!({"label": "ham"}));
        assert_eq!(response.content, json!({"label": "ham"}));
        assert_eq!(response.usage.total_tokens(), 0);
    }
}
