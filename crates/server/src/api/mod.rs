use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conduit_core::EngineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config).await?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Workflows
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::register_workflow),
        )
        .route("/api/workflows/{workflow_id}", get(handlers::get_workflow))
        .route(
            "/api/workflows/{workflow_id}/versions",
            get(handlers::list_versions),
        )
        .route(
            "/api/workflows/{workflow_id}/execute",
            post(handlers::execute_workflow),
        )
        // Executions
        .route("/api/executions", get(handlers::list_executions))
        .route(
            "/api/executions/{execution_id}",
            get(handlers::get_execution),
        )
        // Templates
        .route("/api/templates", get(handlers::list_templates))
        .route("/api/templates/{template_id}", get(handlers::get_template))
        .route(
            "/api/templates/{template_id}/instantiate",
            post(handlers::instantiate_template),
        )
        // Statistics
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/stats/{workflow_id}", get(handlers::get_workflow_stats))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "conduit",
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

/// Error type for API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(err) => match err {
                EngineError::NotFound(_)
                | EngineError::VersionNotFound { .. }
                | EngineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Validation(_)
                | EngineError::InvalidInput(_)
                | EngineError::Template(_) => StatusCode::BAD_REQUEST,
                EngineError::AlreadyRegistered { .. } => StatusCode::CONFLICT,
                EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let response = match &self {
            ApiError::Engine(EngineError::Validation(errors)) => ErrorResponse::with_details(
                "workflow failed validation",
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            ApiError::Engine(EngineError::Storage(err)) => {
                tracing::error!("Storage failure: {:#}", err);
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
            other => ErrorResponse::new(other.to_string()),
        };

        (status, Json(response)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
