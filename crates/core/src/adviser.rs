// Advisers decide what happens after a node changes status

use crate::error::{EngineError, EngineResult};
use crate::expression::AmbianceExpressionEvaluator;
use crate::types::{u64_param, Ambiance, NodeExecution, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct AdvisingContext<'a> {
    pub ambiance: &'a Ambiance,
    pub node_execution: &'a NodeExecution,
    pub from_status: Status,
    pub to_status: Status,
    /// Obtainment parameters, already resolved against the graph
    pub parameters: &'a Value,
    pub evaluator: &'a AmbianceExpressionEvaluator,
}

/// Advice on how the plan continues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "advise_type", rename_all = "snake_case")]
pub enum AdviserResponse {
    /// Continue with `next_node_id`; `None` ends the current chain
    NextStep {
        next_node_id: Option<String>,
    },
    Retry {
        wait_ms: u64,
        retry_number: u32,
    },
    EndPlan,
    /// No adviser produced a decision
    Unknown,
}

#[async_trait::async_trait]
pub trait Adviser: Send + Sync {
    fn adviser_type(&self) -> &str;

    fn can_handle(&self, ctx: &AdvisingContext<'_>) -> bool;

    /// `None` passes the decision to the next obtainment
    async fn decide(&self, ctx: &AdvisingContext<'_>) -> EngineResult<Option<AdviserResponse>>;
}

#[derive(Default, Clone)]
pub struct AdviserRegistry {
    advisers: HashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// ON_SUCCESS, ON_FAIL, RETRY and ABORT
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OnSuccessAdviser));
        registry.register(Arc::new(OnFailAdviser));
        registry.register(Arc::new(RetryAdviser));
        registry.register(Arc::new(AbortAdviser));
        registry
    }

    pub fn register(&mut self, adviser: Arc<dyn Adviser>) {
        self.advisers
            .insert(adviser.adviser_type().to_string(), adviser);
    }

    pub fn get(&self, adviser_type: &str) -> EngineResult<Arc<dyn Adviser>> {
        self.advisers
            .get(adviser_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAdviser(adviser_type.to_string()))
    }
}

fn next_node_id(parameters: &Value) -> Option<String> {
    parameters
        .get("nextNodeId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub struct OnSuccessAdviser;

#[async_trait::async_trait]
impl Adviser for OnSuccessAdviser {
    fn adviser_type(&self) -> &str {
        "ON_SUCCESS"
    }

    fn can_handle(&self, ctx: &AdvisingContext<'_>) -> bool {
        matches!(ctx.to_status, Status::Succeeded | Status::Skipped)
    }

    async fn decide(&self, ctx: &AdvisingContext<'_>) -> EngineResult<Option<AdviserResponse>> {
        Ok(Some(AdviserResponse::NextStep {
            next_node_id: next_node_id(ctx.parameters),
        }))
    }
}

pub struct OnFailAdviser;

#[async_trait::async_trait]
impl Adviser for OnFailAdviser {
    fn adviser_type(&self) -> &str {
        "ON_FAIL"
    }

    fn can_handle(&self, ctx: &AdvisingContext<'_>) -> bool {
        ctx.to_status.is_broken()
    }

    async fn decide(&self, ctx: &AdvisingContext<'_>) -> EngineResult<Option<AdviserResponse>> {
        Ok(Some(AdviserResponse::NextStep {
            next_node_id: next_node_id(ctx.parameters),
        }))
    }
}

/// Retries a broken node `maxRetries` times, waiting `waitMs` between attempts.
/// Once exhausted, continues with `nextNodeId` or ends the plan.
pub struct RetryAdviser;

#[async_trait::async_trait]
impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> &str {
        "RETRY"
    }

    fn can_handle(&self, ctx: &AdvisingContext<'_>) -> bool {
        ctx.to_status.is_broken()
    }

    async fn decide(&self, ctx: &AdvisingContext<'_>) -> EngineResult<Option<AdviserResponse>> {
        let max_retries = u64_param(ctx.parameters, "maxRetries")?.unwrap_or(0);
        let wait_ms = u64_param(ctx.parameters, "waitMs")?.unwrap_or(0);
        let attempts = ctx.node_execution.retry_ids.len() as u64;

        if attempts < max_retries {
            tracing::info!(
                "Retrying node execution {} (attempt {} of {})",
                ctx.node_execution.uuid,
                attempts + 1,
                max_retries
            );
            return Ok(Some(AdviserResponse::Retry {
                wait_ms,
                retry_number: (attempts + 1) as u32,
            }));
        }

        Ok(Some(match next_node_id(ctx.parameters) {
            Some(next) => AdviserResponse::NextStep {
                next_node_id: Some(next),
            },
            None => AdviserResponse::EndPlan,
        }))
    }
}

pub struct AbortAdviser;

#[async_trait::async_trait]
impl Adviser for AbortAdviser {
    fn adviser_type(&self) -> &str {
        "ABORT"
    }

    fn can_handle(&self, ctx: &AdvisingContext<'_>) -> bool {
        ctx.to_status == Status::Aborted
    }

    async fn decide(&self, _ctx: &AdvisingContext<'_>) -> EngineResult<Option<AdviserResponse>> {
        Ok(Some(AdviserResponse::EndPlan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEvaluatorProvider;
    use crate::storage::InMemoryExecutionStore;
    use crate::test_support::three_level_graph;
    use serde_json::json;

    #[tokio::test]
    async fn test_retry_adviser_exhausts_attempts() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let graph = three_level_graph(&store).await;
        let evaluator = ExpressionEvaluatorProvider::new(store)
            .evaluator(graph.step.ambiance.clone())
            .unwrap();
        let parameters = json!({"maxRetries": 2, "waitMs": 500});

        let mut node_execution = graph.step.clone();
        let ctx = AdvisingContext {
            ambiance: &node_execution.ambiance,
            node_execution: &node_execution,
            from_status: Status::Running,
            to_status: Status::Failed,
            parameters: &parameters,
            evaluator: &evaluator,
        };
        assert!(RetryAdviser.can_handle(&ctx));
        assert_eq!(
            RetryAdviser.decide(&ctx).await.unwrap(),
            Some(AdviserResponse::Retry {
                wait_ms: 500,
                retry_number: 1
            })
        );

        node_execution.retry_ids = vec!["r1".to_string(), "r2".to_string()];
        let ctx = AdvisingContext {
            ambiance: &node_execution.ambiance,
            node_execution: &node_execution,
            from_status: Status::Running,
            to_status: Status::Failed,
            parameters: &parameters,
            evaluator: &evaluator,
        };
        assert_eq!(
            RetryAdviser.decide(&ctx).await.unwrap(),
            Some(AdviserResponse::EndPlan)
        );
    }

    #[tokio::test]
    async fn test_status_gates() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let graph = three_level_graph(&store).await;
        let evaluator = ExpressionEvaluatorProvider::new(store)
            .evaluator(graph.step.ambiance.clone())
            .unwrap();
        let parameters = json!({"nextNodeId": "deploy"});
        let ctx = AdvisingContext {
            ambiance: &graph.step.ambiance,
            node_execution: &graph.step,
            from_status: Status::Running,
            to_status: Status::Succeeded,
            parameters: &parameters,
            evaluator: &evaluator,
        };

        assert!(OnSuccessAdviser.can_handle(&ctx));
        assert!(!OnFailAdviser.can_handle(&ctx));
        assert!(!AbortAdviser.can_handle(&ctx));
        assert_eq!(
            OnSuccessAdviser.decide(&ctx).await.unwrap(),
            Some(AdviserResponse::NextStep {
                next_node_id: Some("deploy".to_string())
            })
        );
    }

    #[test]
    fn test_registry_miss_is_loud() {
        let registry = AdviserRegistry::with_defaults();
        assert!(registry.get("RETRY").is_ok());
        assert!(matches!(
            registry.get("MANUAL_INTERVENTION"),
            Err(EngineError::UnknownAdviser(_))
        ));
    }
}
