// Node execution event dispatcher

pub mod processor;

pub use processor::{
    AsyncProcessor, ExecutableProcessor, ProcessorOutcome, ProcessorRegistry, Step,
    StepInputPackage, StepRegistry, SyncProcessor,
};

use crate::adviser::{AdviserRegistry, AdviserResponse, AdvisingContext};
use crate::error::{EngineError, EngineResult};
use crate::events::{
    AsyncResponseData, EventPayload, NodeExecutionEvent, OutboundResponse, ResponseBody,
    StepResponse,
};
use crate::expression::{AmbianceExpressionEvaluator, ExpressionEvaluatorProvider};
use crate::facilitator::{FacilitationContext, FacilitatorRegistry, FacilitatorResponse};
use crate::governance::{GovernanceGate, GovernanceRequest, ON_RUN_ACTION};
use crate::notify::ResponseChannel;
use crate::stage::{StageCreateParams, StageExecutionInfoService, StageExecutionUpdate};
use crate::storage::NodeExecutionStore;
use crate::types::{
    ExecutionMode, FailureInfo, FailureType, GovernanceMetadata, NodeExecution, Status,
    StepCategory,
};
use anyhow::Context;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Routes node execution events to facilitators, advisers and processors.
///
/// Every event produces exactly one response on the response channel, keyed
/// by the event's notify id.
pub struct NodeExecutionEventDispatcher {
    store: Arc<dyn NodeExecutionStore>,
    evaluators: ExpressionEvaluatorProvider,
    facilitators: Arc<FacilitatorRegistry>,
    advisers: Arc<AdviserRegistry>,
    processors: Arc<ProcessorRegistry>,
    responses: Arc<dyn ResponseChannel>,
    stage_service: Option<Arc<StageExecutionInfoService>>,
    governance: Option<Arc<GovernanceGate>>,
}

impl NodeExecutionEventDispatcher {
    pub fn new(
        store: Arc<dyn NodeExecutionStore>,
        facilitators: Arc<FacilitatorRegistry>,
        advisers: Arc<AdviserRegistry>,
        processors: Arc<ProcessorRegistry>,
        responses: Arc<dyn ResponseChannel>,
    ) -> Self {
        Self {
            evaluators: ExpressionEvaluatorProvider::new(store.clone()),
            store,
            facilitators,
            advisers,
            processors,
            responses,
            stage_service: None,
            governance: None,
        }
    }

    pub fn with_evaluators(mut self, evaluators: ExpressionEvaluatorProvider) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn with_stage_service(mut self, stage_service: Arc<StageExecutionInfoService>) -> Self {
        self.stage_service = Some(stage_service);
        self
    }

    pub fn with_governance(mut self, governance: Arc<GovernanceGate>) -> Self {
        self.governance = Some(governance);
        self
    }

    /// Handle one event and deliver its response.
    ///
    /// Returns whether the event was handled successfully. Only a failure to
    /// deliver the response is returned as an error.
    pub async fn dispatch(&self, event: NodeExecutionEvent) -> anyhow::Result<bool> {
        let ne = &event.node_execution;
        tracing::info!(
            "Handling {} event {} for node execution {} ({})",
            event.event_type(),
            event.id,
            ne.uuid,
            ne.node.identifier
        );

        let (body, handled) = match &event.payload {
            EventPayload::Start { mode } => self.handle_start(ne, *mode).await,
            EventPayload::Facilitate {} => match self.facilitate(ne).await {
                Ok(decision) => (ResponseBody::FacilitatorDecision(decision), true),
                Err(e) => event_error(ne, "facilitation", e),
            },
            EventPayload::Resume { response_data } => self.handle_resume(ne, response_data).await,
            EventPayload::Advise {
                from_status,
                to_status,
            } => match self.advise(ne, *from_status, *to_status).await {
                Ok(advice) => (ResponseBody::AdviserDecision(advice), true),
                Err(e) => event_error(ne, "advising", e),
            },
            EventPayload::Progress { progress_json } => {
                match self.handle_progress(ne, progress_json).await {
                    Ok(()) => (ResponseBody::ProgressHandled { success: true }, true),
                    Err(e) => {
                        tracing::warn!(
                            "Progress update for node execution {} failed: {}",
                            ne.uuid,
                            e
                        );
                        (ResponseBody::ProgressHandled { success: false }, false)
                    }
                }
            }
        };

        self.responses
            .send(OutboundResponse::new(&event, body))
            .await
            .with_context(|| format!("Failed to deliver response for event {}", event.id))?;
        Ok(handled)
    }

    fn evaluator(&self, ne: &NodeExecution) -> EngineResult<AmbianceExpressionEvaluator> {
        self.evaluators.evaluator(ne.ambiance.clone())
    }

    async fn handle_start(
        &self,
        ne: &NodeExecution,
        mode: Option<ExecutionMode>,
    ) -> (ResponseBody, bool) {
        match self.start(ne, mode).await {
            Ok(body) => (body, true),
            Err(e) => {
                tracing::error!("Failed to start node execution {}: {}", ne.uuid, e);
                let response = StepResponse::failed(e.to_failure_info());
                self.record_step_response(ne, &response).await;
                (ResponseBody::StepResponse(response), false)
            }
        }
    }

    async fn start(
        &self,
        ne: &NodeExecution,
        mode: Option<ExecutionMode>,
    ) -> EngineResult<ResponseBody> {
        let evaluator = self.evaluator(ne)?;
        let step_parameters = evaluator.resolve(&ne.node.step_parameters).await?;

        let governance_metadata = match ne.node.step_type.category {
            StepCategory::Pipeline => self.check_governance(ne, &step_parameters).await?,
            _ => None,
        };
        if let Some(metadata) = governance_metadata.as_ref().filter(|m| m.deny) {
            let message = metadata
                .message
                .clone()
                .unwrap_or_else(|| "Pipeline execution denied by policy".to_string());
            tracing::warn!("Node execution {} denied by policy: {}", ne.uuid, message);
            let mut response =
                StepResponse::failed(EngineError::PolicyDenied(message).to_failure_info());
            response.governance_metadata = Some(metadata.clone());
            self.record_step_response(ne, &response).await;
            return Ok(ResponseBody::StepResponse(response));
        }

        if ne.node.step_type.category == StepCategory::Stage {
            self.create_stage(ne).await?;
        }

        let mode = mode
            .or(ne.mode)
            .ok_or_else(|| EngineError::MissingExecutionMode(ne.uuid.clone()))?;
        let processor = self.processors.get(mode)?;

        self.record_status(ne, Status::Running).await;
        let input = StepInputPackage {
            node_execution_id: ne.uuid.clone(),
            step_parameters,
        };
        match processor.handle_start(&ne.ambiance, &ne.node, input).await? {
            ProcessorOutcome::Completed(mut response) => {
                response.governance_metadata = governance_metadata;
                self.record_step_response(ne, &response).await;
                Ok(ResponseBody::StepResponse(response))
            }
            ProcessorOutcome::Suspended(suspend) => {
                tracing::info!(
                    "Node execution {} suspended on {} callback(s)",
                    ne.uuid,
                    suspend.callback_ids.len()
                );
                self.record_status(ne, Status::AsyncWaiting).await;
                Ok(ResponseBody::Suspended(suspend))
            }
        }
    }

    async fn check_governance(
        &self,
        ne: &NodeExecution,
        expanded: &Value,
    ) -> EngineResult<Option<GovernanceMetadata>> {
        let Some(gate) = &self.governance else {
            return Ok(None);
        };
        let scope = ne.ambiance.scope();
        let expanded_json = match expanded {
            Value::Null => String::new(),
            other => serde_json::to_string(other)?,
        };
        let request = GovernanceRequest {
            expanded_json,
            account_id: scope.account_identifier,
            org_id: scope.org_identifier,
            project_id: scope.project_identifier,
            action: ON_RUN_ACTION.to_string(),
            plan_execution_id: ne.ambiance.plan_execution_id.clone(),
        };
        gate.evaluate(&request).await.map(Some)
    }

    async fn create_stage(&self, ne: &NodeExecution) -> EngineResult<()> {
        let Some(stage_service) = &self.stage_service else {
            return Ok(());
        };
        let params = StageCreateParams {
            stage_identifier: Some(ne.node.identifier.clone()),
            stage_name: Some(ne.node.name.clone()),
            ..Default::default()
        };
        match stage_service.create(&ne.ambiance, params).await {
            Ok(_) => Ok(()),
            // Restarted stage, e.g. after a retry
            Err(EngineError::DuplicateKey(key)) => {
                tracing::warn!("Stage execution already exists: {}", key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_resume(
        &self,
        ne: &NodeExecution,
        response_data: &HashMap<String, String>,
    ) -> (ResponseBody, bool) {
        let responses = match parse_async_responses(response_data) {
            Ok(responses) => responses,
            Err(e) => {
                tracing::error!("Invalid resume payload for node execution {}: {}", ne.uuid, e);
                let response = StepResponse::failed(e.to_failure_info());
                self.record_step_response(ne, &response).await;
                return (ResponseBody::StepResponse(response), false);
            }
        };

        if let Some(failure_info) = error_failure_info(&responses) {
            tracing::warn!(
                "Node execution {} resumed with an error response: {}",
                ne.uuid,
                failure_info.error_message
            );
            let response = StepResponse::errored(failure_info);
            self.record_step_response(ne, &response).await;
            return (ResponseBody::StepResponse(response), true);
        }

        match self.resume(ne, responses).await {
            Ok(response) => {
                self.record_step_response(ne, &response).await;
                (ResponseBody::StepResponse(response), true)
            }
            Err(e) => {
                tracing::error!("Failed to resume node execution {}: {}", ne.uuid, e);
                let response = StepResponse::failed(e.to_failure_info());
                self.record_step_response(ne, &response).await;
                (ResponseBody::StepResponse(response), false)
            }
        }
    }

    async fn resume(
        &self,
        ne: &NodeExecution,
        responses: HashMap<String, AsyncResponseData>,
    ) -> EngineResult<StepResponse> {
        let mode = ne
            .mode
            .ok_or_else(|| EngineError::MissingExecutionMode(ne.uuid.clone()))?;
        let processor = self.processors.get(mode)?;
        let evaluator = self.evaluator(ne)?;
        let input = StepInputPackage {
            node_execution_id: ne.uuid.clone(),
            step_parameters: evaluator.resolve(&ne.node.step_parameters).await?,
        };
        self.record_status(ne, Status::Running).await;
        processor
            .handle_resume(&ne.ambiance, &ne.node, input, responses)
            .await
    }

    /// First facilitator, in declaration order, that decides
    async fn facilitate(&self, ne: &NodeExecution) -> EngineResult<FacilitatorResponse> {
        let evaluator = self.evaluator(ne)?;
        for obtainment in &ne.node.facilitator_obtainments {
            let facilitator = self.facilitators.get(&obtainment.obtainment_type)?;
            let parameters = evaluator.resolve(&obtainment.parameters).await?;
            let ctx = FacilitationContext {
                ambiance: &ne.ambiance,
                node_execution: ne,
                parameters: &parameters,
                evaluator: &evaluator,
            };
            if !facilitator.can_handle(&ctx) {
                continue;
            }
            if let Some(decision) = facilitator.decide(&ctx).await? {
                tracing::debug!(
                    "Facilitator {} decided for node execution {}",
                    obtainment.obtainment_type,
                    ne.uuid
                );
                return Ok(decision);
            }
        }

        tracing::warn!("No facilitator decided for node execution {}", ne.uuid);
        Ok(FacilitatorResponse::Failed {
            message: format!(
                "No facilitator produced a decision for node {}",
                ne.node.identifier
            ),
        })
    }

    /// First adviser, in declaration order, that decides
    async fn advise(
        &self,
        ne: &NodeExecution,
        from_status: Status,
        to_status: Status,
    ) -> EngineResult<AdviserResponse> {
        let evaluator = self.evaluator(ne)?;
        for obtainment in &ne.node.adviser_obtainments {
            let adviser = self.advisers.get(&obtainment.obtainment_type)?;
            let parameters = evaluator.resolve(&obtainment.parameters).await?;
            let ctx = AdvisingContext {
                ambiance: &ne.ambiance,
                node_execution: ne,
                from_status,
                to_status,
                parameters: &parameters,
                evaluator: &evaluator,
            };
            if !adviser.can_handle(&ctx) {
                continue;
            }
            if let Some(advice) = adviser.decide(&ctx).await? {
                tracing::debug!(
                    "Adviser {} decided for node execution {}",
                    obtainment.obtainment_type,
                    ne.uuid
                );
                return Ok(advice);
            }
        }
        Ok(AdviserResponse::Unknown)
    }

    async fn handle_progress(&self, ne: &NodeExecution, progress_json: &str) -> EngineResult<()> {
        let progress: Value = serde_json::from_str(progress_json)?;
        let mode = ne
            .mode
            .ok_or_else(|| EngineError::MissingExecutionMode(ne.uuid.clone()))?;
        self.processors
            .get(mode)?
            .handle_progress(&ne.ambiance, &ne.node, progress)
            .await
    }

    /// Compare-and-set the stored status. Missing records and lost races are
    /// only logged; the event response is authoritative.
    async fn record_status(&self, ne: &NodeExecution, to: Status) -> Option<NodeExecution> {
        match self
            .store
            .update_status(&ne.uuid, to, &Status::predecessors(to))
            .await
        {
            Ok(Some(updated)) => Some(updated),
            Ok(None) => {
                tracing::debug!("Node execution {} not moved to {}", ne.uuid, to);
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to record status {} for node execution {}: {:#}",
                    to,
                    ne.uuid,
                    e
                );
                None
            }
        }
    }

    /// Persist a step response on the node and, for stages, on the stage entity
    async fn record_step_response(&self, ne: &NodeExecution, response: &StepResponse) {
        if let Some(mut updated) = self.record_status(ne, response.status).await {
            if !response.outcomes.is_empty() || response.failure_info.is_some() {
                updated.outcomes.extend(response.outcomes.clone());
                updated.failure_info = response.failure_info.clone();
                if let Err(e) = self.store.save(&updated).await {
                    tracing::warn!(
                        "Failed to save outcomes of node execution {}: {:#}",
                        ne.uuid,
                        e
                    );
                }
            }
        }

        if ne.node.step_type.category != StepCategory::Stage {
            return;
        }
        let Some(stage_service) = &self.stage_service else {
            return;
        };
        let update =
            StageExecutionUpdate::from_status(response.status, response.failure_info.clone());
        if let Err(e) = stage_service.update(&ne.ambiance, update).await {
            tracing::warn!(
                "Failed to mirror status {} onto stage execution for {}: {}",
                response.status,
                ne.uuid,
                e
            );
        }
    }
}

fn event_error(ne: &NodeExecution, action: &str, e: EngineError) -> (ResponseBody, bool) {
    tracing::error!("Error during {} of node execution {}: {}", action, ne.uuid, e);
    (
        ResponseBody::EventError {
            failure_info: e.to_failure_info(),
        },
        false,
    )
}

fn parse_async_responses(
    response_data: &HashMap<String, String>,
) -> EngineResult<HashMap<String, AsyncResponseData>> {
    response_data
        .iter()
        .map(|(callback_id, raw)| {
            serde_json::from_str::<AsyncResponseData>(raw)
                .map(|data| (callback_id.clone(), data))
                .map_err(|e| {
                    EngineError::InvalidPayload(format!(
                        "response for callback {}: {}",
                        callback_id, e
                    ))
                })
        })
        .collect()
}

/// Failure info built from every error response, in callback id order
fn error_failure_info(responses: &HashMap<String, AsyncResponseData>) -> Option<FailureInfo> {
    let errors: BTreeMap<&String, (&String, &Vec<FailureType>)> = responses
        .iter()
        .filter_map(|(id, data)| match data {
            AsyncResponseData::Error {
                message,
                failure_types,
            } => Some((id, (message, failure_types))),
            AsyncResponseData::Success { .. } => None,
        })
        .collect();
    if errors.is_empty() {
        return None;
    }

    let message = errors
        .values()
        .map(|(message, _)| message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let mut failure_types: Vec<FailureType> = Vec::new();
    for failure_type in errors.values().flat_map(|(_, types)| types.iter().copied()) {
        if !failure_types.contains(&failure_type) {
            failure_types.push(failure_type);
        }
    }
    if failure_types.is_empty() {
        failure_types.push(FailureType::Unknown);
    }
    Some(FailureInfo::new(message, failure_types))
}
