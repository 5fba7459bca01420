use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the event intake server
pub async fn serve(addr: &str, state: AppState) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Event intake listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/events", post(handlers::enqueue_event))
        .route("/api/v1/notify/{notify_id}", get(handlers::await_response))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "stagehand",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Handler error carrying the status code it maps to
pub enum ApiError {
    Timeout(String),
    Unavailable(anyhow::Error),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, response) = match self {
            ApiError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, ErrorResponse::new(msg)),
            ApiError::Unavailable(err) => (StatusCode::SERVICE_UNAVAILABLE, describe(&err)),
            ApiError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, describe(&err)),
        };

        (status, Json(response)).into_response()
    }
}

fn describe(err: &anyhow::Error) -> ErrorResponse {
    let details = err
        .chain()
        .skip(1)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ");

    if details.is_empty() {
        ErrorResponse::new(err.to_string())
    } else {
        ErrorResponse::with_details(err.to_string(), details)
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
