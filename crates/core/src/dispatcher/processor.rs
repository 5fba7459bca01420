// Execution-mode processors and the step plugin seam

use crate::error::{EngineError, EngineResult};
use crate::events::{AsyncResponseData, StepResponse, SuspendResponse};
use crate::types::{Ambiance, ExecutionMode, PlanNode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Inputs handed to a step
#[derive(Debug, Clone)]
pub struct StepInputPackage {
    pub node_execution_id: String,
    /// Step parameters with every expression resolved
    pub step_parameters: Value,
}

/// Result of starting a step
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutcome {
    Completed(StepResponse),
    Suspended(SuspendResponse),
}

/// A unit of work behind a step type. The catalog of steps lives outside the
/// core; unsupported operations report a usage error.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn step_type(&self) -> &str;

    async fn execute_sync(
        &self,
        _ambiance: &Ambiance,
        _input: &StepInputPackage,
    ) -> EngineResult<StepResponse> {
        Err(EngineError::Usage(format!(
            "step type {} cannot run synchronously",
            self.step_type()
        )))
    }

    async fn execute_async(
        &self,
        _ambiance: &Ambiance,
        _input: &StepInputPackage,
    ) -> EngineResult<SuspendResponse> {
        Err(EngineError::Usage(format!(
            "step type {} cannot run asynchronously",
            self.step_type()
        )))
    }

    async fn handle_async_response(
        &self,
        _ambiance: &Ambiance,
        _input: &StepInputPackage,
        _responses: &HashMap<String, AsyncResponseData>,
    ) -> EngineResult<StepResponse> {
        Err(EngineError::Usage(format!(
            "step type {} does not accept async responses",
            self.step_type()
        )))
    }

    async fn handle_progress(&self, _ambiance: &Ambiance, _progress: &Value) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.step_type().to_string(), step);
    }

    pub fn get(&self, step_type: &str) -> EngineResult<Arc<dyn Step>> {
        self.steps
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStepType(step_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Runs nodes of one execution mode
#[async_trait::async_trait]
pub trait ExecutableProcessor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    async fn handle_start(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        input: StepInputPackage,
    ) -> EngineResult<ProcessorOutcome>;

    async fn handle_resume(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        input: StepInputPackage,
        responses: HashMap<String, AsyncResponseData>,
    ) -> EngineResult<StepResponse>;

    async fn handle_progress(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        progress: Value,
    ) -> EngineResult<()>;
}

#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<ExecutionMode, Arc<dyn ExecutableProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync and async processors over `steps`
    pub fn with_defaults(steps: Arc<StepRegistry>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SyncProcessor::new(steps.clone())));
        registry.register(Arc::new(AsyncProcessor::new(steps)));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn ExecutableProcessor>) {
        self.processors.insert(processor.mode(), processor);
    }

    pub fn get(&self, mode: ExecutionMode) -> EngineResult<Arc<dyn ExecutableProcessor>> {
        self.processors
            .get(&mode)
            .cloned()
            .ok_or(EngineError::UnknownExecutionMode(mode))
    }
}

pub struct SyncProcessor {
    steps: Arc<StepRegistry>,
}

impl SyncProcessor {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }
}

#[async_trait::async_trait]
impl ExecutableProcessor for SyncProcessor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    async fn handle_start(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        input: StepInputPackage,
    ) -> EngineResult<ProcessorOutcome> {
        let step = self.steps.get(&node.step_type.step_type)?;
        let response = step.execute_sync(ambiance, &input).await?;
        Ok(ProcessorOutcome::Completed(response))
    }

    async fn handle_resume(
        &self,
        _ambiance: &Ambiance,
        node: &PlanNode,
        _input: StepInputPackage,
        _responses: HashMap<String, AsyncResponseData>,
    ) -> EngineResult<StepResponse> {
        Err(EngineError::Usage(format!(
            "node {} runs synchronously and cannot be resumed",
            node.identifier
        )))
    }

    async fn handle_progress(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        progress: Value,
    ) -> EngineResult<()> {
        let step = self.steps.get(&node.step_type.step_type)?;
        step.handle_progress(ambiance, &progress).await
    }
}

pub struct AsyncProcessor {
    steps: Arc<StepRegistry>,
}

impl AsyncProcessor {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }
}

#[async_trait::async_trait]
impl ExecutableProcessor for AsyncProcessor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn handle_start(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        input: StepInputPackage,
    ) -> EngineResult<ProcessorOutcome> {
        let step = self.steps.get(&node.step_type.step_type)?;
        let suspend = step.execute_async(ambiance, &input).await?;
        if suspend.callback_ids.is_empty() {
            return Err(EngineError::Usage(format!(
                "async step {} returned no callback ids",
                node.identifier
            )));
        }
        Ok(ProcessorOutcome::Suspended(suspend))
    }

    async fn handle_resume(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        input: StepInputPackage,
        responses: HashMap<String, AsyncResponseData>,
    ) -> EngineResult<StepResponse> {
        let step = self.steps.get(&node.step_type.step_type)?;
        step.handle_async_response(ambiance, &input, &responses).await
    }

    async fn handle_progress(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        progress: Value,
    ) -> EngineResult<()> {
        let step = self.steps.get(&node.step_type.step_type)?;
        step.handle_progress(ambiance, &progress).await
    }
}
