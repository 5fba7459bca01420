// Error taxonomy for the orchestration core

use crate::types::{ExecutionMode, FailureInfo, FailureType};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No facilitator registered for an obtainment type.
    #[error("Unknown facilitator type: {0}")]
    UnknownFacilitator(String),

    /// No adviser registered for an obtainment type.
    #[error("Unknown adviser type: {0}")]
    UnknownAdviser(String),

    #[error("No processor registered for execution mode {0:?}")]
    UnknownExecutionMode(ExecutionMode),

    #[error("Node execution {0} has no execution mode")]
    MissingExecutionMode(String),

    #[error("No step registered for step type {0}")]
    UnknownStepType(String),

    /// Malformed expression text.
    #[error("Invalid expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("Expression could not be resolved: {0}")]
    UnresolvedExpression(String),

    /// A field processor reported an error; the resolved object must not be used.
    #[error("Critical error while evaluating expressions: {0}")]
    CriticalExpressionEvaluation(String),

    /// Misuse of an API, e.g. registering aliases after first evaluation.
    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Write was not acknowledged: {0}")]
    UnacknowledgedWrite(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Policy evaluation failed: {0}")]
    PolicyEvaluation(String),

    #[error("Policy denied execution: {0}")]
    PolicyDenied(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Failure classes reported alongside this error
    pub fn failure_types(&self) -> Vec<FailureType> {
        match self {
            EngineError::InvalidExpression { .. }
            | EngineError::UnresolvedExpression(_)
            | EngineError::CriticalExpressionEvaluation(_) => vec![FailureType::Expression],
            EngineError::PolicyEvaluation(_) | EngineError::PolicyDenied(_) => {
                vec![FailureType::PolicyEvaluation]
            }
            EngineError::Storage(_) | EngineError::UnacknowledgedWrite(_) => {
                vec![FailureType::Connectivity]
            }
            EngineError::UnknownFacilitator(_)
            | EngineError::UnknownAdviser(_)
            | EngineError::UnknownExecutionMode(_)
            | EngineError::MissingExecutionMode(_)
            | EngineError::UnknownStepType(_)
            | EngineError::Usage(_)
            | EngineError::InvalidPayload(_)
            | EngineError::DuplicateKey(_)
            | EngineError::Json(_) => vec![FailureType::Application],
        }
    }

    /// Structured failure info for step responses and event errors
    pub fn to_failure_info(&self) -> FailureInfo {
        FailureInfo::new(self.to_string(), self.failure_types())
    }
}
