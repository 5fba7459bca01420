use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use stagehand_core::events::{EventPayload, NodeExecutionEvent, OutboundResponse};
use stagehand_core::types::NodeExecution;
use std::sync::Arc;

/// Queue an event for the worker pool
pub async fn enqueue_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueEventRequest>,
) -> ApiResult<(StatusCode, Json<EnqueueEventResponse>)> {
    let mut event = NodeExecutionEvent::new(req.node_execution, req.payload);
    if let Some(notify_id) = req.notify_id {
        event.notify_id = notify_id;
    }

    let response = EnqueueEventResponse {
        event_id: event.id.clone(),
        notify_id: event.notify_id.clone(),
    };

    let event_type = event.event_type();
    let node_execution_id = event.node_execution.uuid.clone();
    state.queue.enqueue(event).await.map_err(ApiError::Unavailable)?;
    tracing::info!(
        "Queued {} event {} for node execution {}",
        event_type,
        response.event_id,
        node_execution_id
    );

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueEventRequest {
    /// Caller-chosen correlation id; generated when absent
    pub notify_id: Option<String>,
    pub node_execution: NodeExecution,
    pub payload: EventPayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueEventResponse {
    pub event_id: String,
    pub notify_id: String,
}

/// Block until the response for `notify_id` arrives
pub async fn await_response(
    State(state): State<Arc<AppState>>,
    Path(notify_id): Path<String>,
) -> ApiResult<Json<OutboundResponse>> {
    state
        .notify_hub
        .wait(&notify_id, state.notify_timeout)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::Timeout(format!("No response for {} yet", notify_id)))
}
