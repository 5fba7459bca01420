use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Generate a fresh string identifier
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Technical status of a node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotStarted,
    Running,
    /// Suspended while waiting on an external async response
    AsyncWaiting,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    Skipped,
    /// Leaf asked to stop; settles as Aborted once it acknowledges
    Discontinuing,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::NotStarted,
        Status::Running,
        Status::AsyncWaiting,
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Aborted,
        Status::Skipped,
        Status::Discontinuing,
    ];

    /// Statuses from which `to` may be entered
    pub fn predecessors(to: Status) -> Vec<Status> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Errored | Status::Aborted | Status::Skipped
        )
    }

    /// Failed or errored
    pub fn is_broken(self) -> bool {
        matches!(self, Status::Failed | Status::Errored)
    }

    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        match self {
            NotStarted => matches!(
                to,
                Running | Skipped | Aborted | Failed | Errored | Discontinuing
            ),
            Running => matches!(
                to,
                AsyncWaiting | Succeeded | Failed | Errored | Aborted | Discontinuing
            ),
            AsyncWaiting => matches!(
                to,
                Running | Succeeded | Failed | Errored | Aborted | Discontinuing
            ),
            Discontinuing => matches!(to, Aborted | Errored),
            Succeeded | Failed | Errored | Aborted | Skipped => false,
        }
    }

    /// Business-level stage status derived from a technical status
    pub fn stage_status(self) -> StageStatus {
        match self {
            Status::Succeeded | Status::Skipped => StageStatus::Succeeded,
            Status::Failed | Status::Errored => StageStatus::Failed,
            Status::Aborted => StageStatus::Aborted,
            Status::NotStarted
            | Status::Running
            | Status::AsyncWaiting
            | Status::Discontinuing => StageStatus::InProgress,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::NotStarted => "NOT_STARTED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Discontinuing => "DISCONTINUING",
        };
        f.write_str(s)
    }
}

/// Coarse, business-level status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

/// Classification attached to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Unknown,
    Application,
    Connectivity,
    Authentication,
    Authorization,
    Timeout,
    Verification,
    PolicyEvaluation,
    Expression,
}

/// One structured failure entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureData {
    pub message: String,
    pub code: String,
    pub level: String,
    pub failure_types: Vec<FailureType>,
}

/// Failure details carried by step responses and execution records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_message: String,
    pub failure_types: Vec<FailureType>,
    #[serde(default)]
    pub failure_data: Vec<FailureData>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        let message = message.into();
        Self {
            failure_data: vec![FailureData {
                message: message.clone(),
                code: "GENERAL_ERROR".to_string(),
                level: "ERROR".to_string(),
                failure_types: failure_types.clone(),
            }],
            error_message: message,
            failure_types,
        }
    }
}

/// Kind of graph node a level or plan node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    StepGroup,
    Step,
    Fork,
    Strategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    #[serde(rename = "type")]
    pub step_type: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(step_type: impl Into<String>, category: StepCategory) -> Self {
        Self {
            step_type: step_type.into(),
            category,
        }
    }
}

/// One depth of the execution graph as seen from the current node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Node execution id at this depth
    pub runtime_id: String,
    /// Plan node id at this depth
    pub setup_id: String,
    pub identifier: String,
    #[serde(default)]
    pub group: Option<String>,
    pub step_type: StepType,
    pub start_ts: i64,
    /// Number of retries that preceded this node execution
    #[serde(default)]
    pub retry_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: String,
    pub triggered_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub run_sequence: u64,
    #[serde(default)]
    pub pipeline_identifier: String,
    #[serde(default)]
    pub trigger_info: Option<TriggerInfo>,
}

/// Immutable execution context carried on every event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_id: String,
    pub plan_execution_id: String,
    #[serde(default)]
    pub stage_execution_id: Option<String>,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

/// Execution mode selected by facilitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
}

/// Non-negative integer obtainment parameter, given as a number or a numeric string
pub(crate) fn u64_param(parameters: &Value, key: &str) -> EngineResult<Option<u64>> {
    match parameters.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| {
                EngineError::InvalidPayload(format!("{} must be a positive integer", key))
            }),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| EngineError::InvalidPayload(format!("{} is not a number: {}", key, s))),
        Some(other) => Err(EngineError::InvalidPayload(format!(
            "{} has unexpected type: {}",
            key, other
        ))),
    }
}

/// Reference from a plan node to a facilitator or adviser by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obtainment {
    #[serde(rename = "type")]
    pub obtainment_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl Obtainment {
    pub fn new(obtainment_type: impl Into<String>) -> Self {
        Self {
            obtainment_type: obtainment_type.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Immutable node definition from the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    /// Fully qualified name, e.g. `pipeline.stages.deploy.spec.execution.steps.shell`
    #[serde(default)]
    pub fqn: String,
    #[serde(default)]
    pub group: Option<String>,
    pub step_type: StepType,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default)]
    pub facilitator_obtainments: Vec<Obtainment>,
    #[serde(default)]
    pub adviser_obtainments: Vec<Obtainment>,
}

/// One record per graph node instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: String,
    pub ambiance: Ambiance,
    pub node: PlanNode,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub previous_id: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
    #[serde(default)]
    pub sweeping_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Superseded by a retry; hidden from child listings
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub start_ts: Option<i64>,
    #[serde(default)]
    pub end_ts: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new(
        uuid: impl Into<String>,
        ambiance: Ambiance,
        node: PlanNode,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            ambiance,
            node,
            parent_id,
            previous_id: None,
            status: Status::NotStarted,
            mode: None,
            outcomes: BTreeMap::new(),
            sweeping_outputs: BTreeMap::new(),
            failure_info: None,
            retry_ids: Vec::new(),
            old_retry: false,
            start_ts: None,
            end_ts: None,
            created_at: Utc::now(),
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.ambiance.plan_execution_id
    }

    /// Fresh attempt of this node execution under `uuid`.
    ///
    /// The previous attempt is appended to `retry_ids` and the current level
    /// of the ambiance points at the new attempt.
    pub fn new_retry(&self, uuid: impl Into<String>) -> Self {
        let uuid = uuid.into();
        let mut retry_ids = self.retry_ids.clone();
        retry_ids.push(self.uuid.clone());

        let mut ambiance = self.ambiance.clone();
        if let Some(level) = ambiance.levels.last_mut() {
            level.runtime_id = uuid.clone();
            level.retry_index = u32::try_from(retry_ids.len()).unwrap_or(u32::MAX);
        }

        let mut retry = Self::new(uuid, ambiance, self.node.clone(), self.parent_id.clone());
        retry.previous_id = self.previous_id.clone();
        retry.mode = self.mode;
        retry.retry_ids = retry_ids;
        retry
    }
}

/// Account/org/project triple scoping persisted entities
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub account_identifier: String,
    pub org_identifier: String,
    pub project_identifier: String,
}

impl Scope {
    pub fn new(
        account_identifier: impl Into<String>,
        org_identifier: impl Into<String>,
        project_identifier: impl Into<String>,
    ) -> Self {
        Self {
            account_identifier: account_identifier.into(),
            org_identifier: org_identifier.into(),
            project_identifier: project_identifier.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Per-stage execution summary row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionEntity {
    pub uuid: String,
    pub account_identifier: String,
    pub org_identifier: String,
    pub project_identifier: String,
    pub stage_execution_id: String,
    pub plan_execution_id: String,
    #[serde(default)]
    pub stage_identifier: Option<String>,
    #[serde(default)]
    pub stage_name: Option<String>,
    pub status: Status,
    pub stage_status: StageStatus,
    #[serde(default)]
    pub stage_execution_summary: serde_json::Map<String, Value>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub start_ts: Option<i64>,
    #[serde(default)]
    pub end_ts: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl StageExecutionEntity {
    pub fn scope(&self) -> Scope {
        Scope::new(
            &self.account_identifier,
            &self.org_identifier,
            &self.project_identifier,
        )
    }
}

/// Result of one policy inside a policy set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub identifier: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub deny_messages: Vec<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

/// Result of one policy set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySetMetadata {
    pub identifier: String,
    pub name: String,
    pub status: String,
    pub deny: bool,
    #[serde(default)]
    pub policy_metadata: Vec<PolicyMetadata>,
}

/// Verdict of one governance check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceMetadata {
    pub id: String,
    pub deny: bool,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Vec<PolicySetMetadata>,
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(Status::NotStarted.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::AsyncWaiting));
        assert!(Status::AsyncWaiting.can_transition_to(Status::Running));
        assert!(Status::AsyncWaiting.can_transition_to(Status::Aborted));
        assert!(!Status::NotStarted.can_transition_to(Status::Succeeded));
        assert!(!Status::Succeeded.can_transition_to(Status::Running));
        assert!(!Status::Aborted.can_transition_to(Status::Failed));
        assert!(Status::Running.can_transition_to(Status::Discontinuing));
        assert!(Status::Discontinuing.can_transition_to(Status::Aborted));
        assert!(!Status::Discontinuing.can_transition_to(Status::Running));
    }

    #[test]
    fn test_start_failures_leave_not_started() {
        // A START can fail before the node is ever marked running
        assert!(Status::predecessors(Status::Failed).contains(&Status::NotStarted));
        assert!(Status::predecessors(Status::Errored).contains(&Status::NotStarted));
        assert!(!Status::predecessors(Status::Succeeded).contains(&Status::NotStarted));
    }

    #[test]
    fn test_new_retry_points_level_at_attempt() {
        let node = PlanNode {
            uuid: "step-setup".to_string(),
            identifier: "step".to_string(),
            name: "Step".to_string(),
            fqn: String::new(),
            group: None,
            step_type: StepType::new("SHELL", StepCategory::Step),
            step_parameters: Value::Null,
            facilitator_obtainments: vec![],
            adviser_obtainments: vec![],
        };
        let ambiance = Ambiance {
            levels: vec![Level {
                runtime_id: "step-1".to_string(),
                setup_id: "step-setup".to_string(),
                identifier: "step".to_string(),
                group: None,
                step_type: node.step_type.clone(),
                start_ts: 1,
                retry_index: 0,
            }],
            ..Default::default()
        };
        let mut first = NodeExecution::new("step-1", ambiance, node, Some("stage".to_string()));
        first.status = Status::Failed;
        first.mode = Some(ExecutionMode::Sync);

        let retry = first.new_retry("step-2");
        assert_eq!(retry.status, Status::NotStarted);
        assert_eq!(retry.retry_ids, vec!["step-1".to_string()]);
        assert_eq!(retry.parent_id.as_deref(), Some("stage"));
        assert_eq!(retry.mode, Some(ExecutionMode::Sync));
        assert_eq!(retry.ambiance.current_runtime_id(), Some("step-2"));
        assert!(retry.ambiance.is_retry());
        assert!(!first.ambiance.is_retry());
    }

    #[test]
    fn test_u64_param_accepts_numbers_and_numeric_strings() {
        let parameters = serde_json::json!({
            "maxRetries": 3,
            "waitMs": " 250 ",
            "negative": -1,
            "flag": true,
        });
        assert_eq!(u64_param(&parameters, "maxRetries").unwrap(), Some(3));
        assert_eq!(u64_param(&parameters, "waitMs").unwrap(), Some(250));
        assert_eq!(u64_param(&parameters, "absent").unwrap(), None);
        assert!(u64_param(&parameters, "negative").is_err());
        assert!(u64_param(&parameters, "flag").is_err());
    }

    #[test]
    fn test_stage_status_mapping() {
        assert_eq!(Status::Running.stage_status(), StageStatus::InProgress);
        assert_eq!(Status::Errored.stage_status(), StageStatus::Failed);
        assert_eq!(Status::Skipped.stage_status(), StageStatus::Succeeded);
        assert_eq!(Status::Aborted.stage_status(), StageStatus::Aborted);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Status::AsyncWaiting).unwrap();
        assert_eq!(json, "\"ASYNC_WAITING\"");
        assert_eq!(Status::AsyncWaiting.to_string(), "ASYNC_WAITING");
    }
}
