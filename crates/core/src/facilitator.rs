// Facilitators decide how a node is executed

use crate::error::{EngineError, EngineResult};
use crate::expression::AmbianceExpressionEvaluator;
use crate::types::{u64_param, Ambiance, ExecutionMode, NodeExecution};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a facilitator may look at
pub struct FacilitationContext<'a> {
    pub ambiance: &'a Ambiance,
    pub node_execution: &'a NodeExecution,
    /// Obtainment parameters, already resolved against the graph
    pub parameters: &'a Value,
    pub evaluator: &'a AmbianceExpressionEvaluator,
}

/// Facilitation decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FacilitatorResponse {
    Proceed {
        execution_mode: ExecutionMode,
        #[serde(default)]
        initial_wait_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pass_through_data: Option<String>,
    },
    Failed {
        message: String,
    },
}

impl FacilitatorResponse {
    pub fn proceed(execution_mode: ExecutionMode) -> Self {
        FacilitatorResponse::Proceed {
            execution_mode,
            initial_wait_ms: 0,
            pass_through_data: None,
        }
    }
}

#[async_trait::async_trait]
pub trait Facilitator: Send + Sync {
    /// Obtainment type this facilitator is registered under
    fn facilitator_type(&self) -> &str;

    fn can_handle(&self, _ctx: &FacilitationContext<'_>) -> bool {
        true
    }

    /// `None` passes the decision to the next obtainment
    async fn decide(&self, ctx: &FacilitationContext<'_>)
        -> EngineResult<Option<FacilitatorResponse>>;
}

/// Facilitators keyed by obtainment type
#[derive(Default, Clone)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<String, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// SYNC, ASYNC and WAIT
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SyncFacilitator));
        registry.register(Arc::new(AsyncFacilitator));
        registry.register(Arc::new(WaitFacilitator));
        registry
    }

    pub fn register(&mut self, facilitator: Arc<dyn Facilitator>) {
        self.facilitators
            .insert(facilitator.facilitator_type().to_string(), facilitator);
    }

    pub fn get(&self, facilitator_type: &str) -> EngineResult<Arc<dyn Facilitator>> {
        self.facilitators
            .get(facilitator_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFacilitator(facilitator_type.to_string()))
    }
}

pub struct SyncFacilitator;

#[async_trait::async_trait]
impl Facilitator for SyncFacilitator {
    fn facilitator_type(&self) -> &str {
        "SYNC"
    }

    async fn decide(
        &self,
        _ctx: &FacilitationContext<'_>,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        Ok(Some(FacilitatorResponse::proceed(ExecutionMode::Sync)))
    }
}

pub struct AsyncFacilitator;

#[async_trait::async_trait]
impl Facilitator for AsyncFacilitator {
    fn facilitator_type(&self) -> &str {
        "ASYNC"
    }

    async fn decide(
        &self,
        _ctx: &FacilitationContext<'_>,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        Ok(Some(FacilitatorResponse::proceed(ExecutionMode::Async)))
    }
}

/// Async execution after an initial delay taken from `initialWaitMs`
pub struct WaitFacilitator;

#[async_trait::async_trait]
impl Facilitator for WaitFacilitator {
    fn facilitator_type(&self) -> &str {
        "WAIT"
    }

    async fn decide(
        &self,
        ctx: &FacilitationContext<'_>,
    ) -> EngineResult<Option<FacilitatorResponse>> {
        Ok(Some(FacilitatorResponse::Proceed {
            execution_mode: ExecutionMode::Async,
            initial_wait_ms: u64_param(ctx.parameters, "initialWaitMs")?.unwrap_or(0),
            pass_through_data: None,
        }))
    }
}
