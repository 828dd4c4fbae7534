//! Decision system that answers every request with the row itself.

use async_trait::async_trait;
use serde_json::Value;

use super::DecisionSystem;
use crate::domain::{DecisionError, DecisionRequest, DecisionResponse, Usage};

/// Dry-run decision system: no external calls, usage equals the estimate
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoDecision;

#[async_trait]
impl DecisionSystem for EchoDecision {
    fn name(&self) -> &str {
        "echo"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        Ok(
            DecisionResponse::new(Value::Object(request.input.clone())).with_usage(Usage {
                prompt_tokens: request.estimated_tokens,
                completion_tokens: 0,
                cost_usd: None,
            }),
        )
    }
}
