use crate::adviser::AdviserResponse;
use crate::facilitator::FacilitatorResponse;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// An inbound node execution event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionEvent {
    pub id: String,
    /// Correlation id the single response is delivered under
    pub notify_id: String,
    pub node_execution: NodeExecution,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

impl NodeExecutionEvent {
    pub fn new(node_execution: NodeExecution, payload: EventPayload) -> Self {
        Self {
            id: generate_uuid(),
            notify_id: generate_uuid(),
            node_execution,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    Facilitate,
    Resume,
    Advise,
    Progress,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Start => "START",
            EventType::Facilitate => "FACILITATE",
            EventType::Resume => "RESUME",
            EventType::Advise => "ADVISE",
            EventType::Progress => "PROGRESS",
        };
        f.write_str(s)
    }
}

/// Event-specific data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Start {
        /// Overrides the mode recorded on the node execution
        #[serde(default)]
        mode: Option<ExecutionMode>,
    },
    Facilitate {},
    Resume {
        /// Callback id to serialized [`AsyncResponseData`]
        response_data: HashMap<String, String>,
    },
    Advise {
        from_status: Status,
        to_status: Status,
    },
    Progress {
        progress_json: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Start { .. } => EventType::Start,
            EventPayload::Facilitate {} => EventType::Facilitate,
            EventPayload::Resume { .. } => EventType::Resume,
            EventPayload::Advise { .. } => EventType::Advise,
            EventPayload::Progress { .. } => EventType::Progress,
        }
    }
}

/// Result of an async task, delivered with RESUME
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AsyncResponseData {
    Success {
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        failure_types: Vec<FailureType>,
    },
}

/// Outcome of running or resuming a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_metadata: Option<GovernanceMetadata>,
}

impl StepResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcomes: BTreeMap::new(),
            governance_metadata: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(Status::Succeeded)
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            failure_info: Some(failure_info),
            ..Self::new(Status::Failed)
        }
    }

    pub fn errored(failure_info: FailureInfo) -> Self {
        Self {
            failure_info: Some(failure_info),
            ..Self::new(Status::Errored)
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcomes.insert(name.into(), value);
        self
    }
}

/// Node suspended until the listed callbacks respond
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendResponse {
    pub callback_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponseBody {
    StepResponse(StepResponse),
    Suspended(SuspendResponse),
    FacilitatorDecision(FacilitatorResponse),
    AdviserDecision(AdviserResponse),
    EventError { failure_info: FailureInfo },
    ProgressHandled { success: bool },
}

/// The single response an event produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub notify_id: String,
    pub event_type: EventType,
    pub body: ResponseBody,
    pub created_at: DateTime<Utc>,
}

impl OutboundResponse {
    pub fn new(event: &NodeExecutionEvent, body: ResponseBody) -> Self {
        Self {
            notify_id: event.notify_id.clone(),
            event_type: event.event_type(),
            body,
            created_at: Utc::now(),
        }
    }
}
