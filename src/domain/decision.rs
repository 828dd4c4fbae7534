//! Requests to and responses from the decision system.
//!
//! A request is derived deterministically from a row and the cycle's
//! settings. The decision system classifies its own failures; the runner
//! never guesses whether an error is retryable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::row::{Row, RowKey};

/// A request compiled from one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Cycle that issued the request
    pub cycle: String,

    /// Key of the originating row
    pub row_key: RowKey,

    /// Static instruction configured for the cycle (may be empty)
    pub instruction: String,

    /// The row's record
    pub input: Map<String, Value>,

    /// Estimated token cost, used when acquiring rate-limit permits
    pub estimated_tokens: u64,
}

impl DecisionRequest {
    /// Compile a request from a row.
    ///
    /// The token estimate is a byte-count heuristic (4 bytes per token) over
    /// the instruction and the serialized record.
    pub fn compile(cycle: &str, instruction: &str, row: &Row) -> Self {
        let input_bytes = serde_json::to_string(&row.data)
            .map(|s| s.len())
            .unwrap_or(0);
        let estimated_tokens = ((instruction.len() + input_bytes) as u64).div_ceil(4).max(1);

        Self {
            cycle: cycle.to_string(),
            row_key: row.key.clone(),
            instruction: instruction.to_string(),
            input: row.data.clone(),
            estimated_tokens,
        }
    }
}

/// Token/cost usage reported by the decision system
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,

    #[serde(default)]
    pub completion_tokens: u64,

    /// Cost in USD, when the provider reports it directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A structured result from the decision system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    /// Structured content of the response
    pub content: Value,

    #[serde(default)]
    pub usage: Usage,
}

impl DecisionResponse {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Classified failure of a decision call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecisionError {
    /// Retryable failure (timeouts, dropped connections, 5xx)
    #[error("transient decision error: {0}")]
    Transient(String),

    /// The provider rejected the call for throughput reasons
    #[error("rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Not retryable; the row fails immediately
    #[error("fatal decision error: {0}")]
    Fatal(String),
}

impl DecisionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Whether the runner may retry the call
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Provider hint for how long to wait before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
