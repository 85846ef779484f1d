use super::{parse_execution_id, ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use flowsmith_core::{
    workflow::ValidationIssue, ExecutionConfig, ExecutionId, ExecutionPlan, GraphModel,
    PlanStatus, ValidationReport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Validate a workflow graph without running it
pub async fn validate_workflow(
    State(state): State<Arc<AppState>>,
    Json(graph): Json<GraphModel>,
) -> ApiResult<Json<ValidationReport>> {
    Ok(Json(state.engine.validate(&graph)))
}

/// Start a new execution; the run continues in the background
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartExecutionRequest>,
) -> ApiResult<impl IntoResponse> {
    let config = req.config.unwrap_or_else(|| state.defaults.clone());
    config.validate()?;

    let prepared = state.engine.prepare(req.workflow, config).await?;
    let execution_id = prepared.id();
    let warnings = prepared.validation().warnings.clone();

    let engine = state.engine.clone();
    tokio::spawn(async move {
        let plan = engine.run(prepared).await;
        tracing::info!(
            "Execution {} finished with status {:?}",
            plan.id,
            plan.status
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartExecutionResponse {
            execution_id,
            warnings,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    pub workflow: GraphModel,
    #[serde(default)]
    pub config: Option<ExecutionConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionResponse {
    pub execution_id: ExecutionId,
    pub warnings: Vec<ValidationIssue>,
}

/// List all known executions
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let executions = state
        .engine
        .list_plans()
        .await
        .iter()
        .map(ExecutionSummary::from_plan)
        .collect();

    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionSummary>,
}

/// Plan overview without per-node outputs
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ExecutionSummary {
    fn from_plan(plan: &ExecutionPlan) -> Self {
        let duration_ms = match (plan.started_at, plan.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            (Some(started), None) => Some((Utc::now() - started).num_milliseconds()),
            _ => None,
        };

        Self {
            id: plan.id,
            status: plan.status,
            error: plan.error.clone(),
            total_nodes: plan.nodes.len(),
            completed_nodes: plan.completed_nodes(),
            failed_nodes: plan.failed_nodes(),
            skipped_nodes: plan.skipped_nodes(),
            started_at: plan.started_at,
            completed_at: plan.completed_at,
            duration_ms,
        }
    }
}

/// Get the latest state of an execution
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionPlan>> {
    let execution_id = parse_execution_id(&execution_id)?;

    let plan = state
        .engine
        .get_plan(execution_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Execution {} not found", execution_id)))?;

    Ok(Json(plan))
}

/// Cancel a running execution
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let execution_id = parse_execution_id(&execution_id)?;

    state.engine.cancel(execution_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "executionId": execution_id,
            "cancelled": true,
        })),
    ))
}
