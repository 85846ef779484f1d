use crate::config::{AppState, ServerConfig};
use crate::websocket;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flowsmith_core::{ConfigError, EngineError, ExecutionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config);

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
        .route("/api/workflows/validate", post(handlers::validate_workflow))
        .route(
            "/api/executions",
            get(handlers::list_executions).post(handlers::start_execution),
        )
        .route("/api/executions/{execution_id}", get(handlers::get_execution))
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::cancel_execution),
        )
        .route("/api/executions/{execution_id}/ws", get(websocket::ws_handler))
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
        "service": "flowsmith",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Custom error type for API handlers
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, anyhow::anyhow!(message.into()))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(message.into()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();

        let details = match self.error.downcast_ref::<EngineError>() {
            Some(EngineError::Validation(report)) => serde_json::to_value(report).ok(),
            _ => {
                let chain = self
                    .error
                    .chain()
                    .skip(1)
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(": ");
                (!chain.is_empty()).then(|| Value::String(chain))
            }
        };

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        (
            self.status,
            Json(ErrorResponse {
                error: error_msg,
                details,
            }),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = if let Some(engine_error) = error.downcast_ref::<EngineError>() {
            match engine_error {
                EngineError::Validation(_) | EngineError::Graph(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                EngineError::NotActive(_) => StatusCode::CONFLICT,
            }
        } else if error.downcast_ref::<ConfigError>().is_some() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        Self { status, error }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn parse_execution_id(raw: &str) -> Result<ExecutionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid execution ID: {}", raw)))
}
