use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use conduit_core::stats::{StatsOverview, WorkflowStats};
use conduit_core::template::{ProcessTemplate, TemplateId};
use conduit_core::workflow::ExecuteOptions;
use conduit_core::{ExecutionId, ExecutionRecord, WorkflowDefinition, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Summary of a registered workflow version
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    pub node_count: usize,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(workflow: &WorkflowDefinition) -> Self {
        Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            version: workflow.version,
            node_count: workflow.node_count(),
        }
    }
}

/// Register a workflow definition
pub async fn register_workflow(
    State(state): State<Arc<AppState>>,
    Json(workflow): Json<WorkflowDefinition>,
) -> ApiResult<(StatusCode, Json<WorkflowSummary>)> {
    let registered = state.engine.register_workflow(workflow).await?;
    Ok((StatusCode::CREATED, Json(WorkflowSummary::from(&*registered))))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
}

/// List the latest version of every workflow
pub async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<ListWorkflowsResponse> {
    let workflows = state
        .engine
        .list_workflows()
        .await
        .iter()
        .map(|w| WorkflowSummary::from(&**w))
        .collect();
    Json(ListWorkflowsResponse { workflows })
}

/// Get the latest version of a workflow
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state
        .engine
        .get_workflow(&WorkflowId::new(workflow_id))
        .await?;
    Ok(Json((*workflow).clone()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListVersionsResponse {
    pub workflow_id: WorkflowId,
    pub versions: Vec<WorkflowSummary>,
}

/// List all versions of a workflow
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<ListVersionsResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let versions = state
        .engine
        .list_versions(&workflow_id)
        .await?
        .iter()
        .map(|w| WorkflowSummary::from(&**w))
        .collect();
    Ok(Json(ListVersionsResponse {
        workflow_id,
        versions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub caller: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: ExecutionId,
    pub record: ExecutionRecord,
}

/// Execute the latest version of a workflow
pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecuteResponse>> {
    let record = state
        .engine
        .execute_with(
            &WorkflowId::new(workflow_id),
            req.input,
            ExecuteOptions {
                caller: req.caller,
                cancellation: None,
            },
        )
        .await?;

    Ok(Json(ExecuteResponse {
        execution_id: record.execution_id,
        record,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionRecord>,
}

/// List execution records, most recent first
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let workflow_id = query.workflow_id.map(WorkflowId::new);
    let executions = state.engine.list_executions(workflow_id.as_ref()).await?;
    Ok(Json(ListExecutionsResponse { executions }))
}

/// Get a specific execution record
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    let execution_id: ExecutionId = execution_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid execution ID: {}", execution_id)))?;

    let record = state.engine.get_execution(&execution_id).await?;
    Ok(Json(record))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTemplatesResponse {
    pub templates: Vec<ProcessTemplate>,
}

/// List the built-in templates
pub async fn list_templates(State(state): State<Arc<AppState>>) -> Json<ListTemplatesResponse> {
    Json(ListTemplatesResponse {
        templates: state.templates.list().into_iter().cloned().collect(),
    })
}

/// Get a template
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<ProcessTemplate>> {
    state
        .templates
        .get(&TemplateId::new(template_id.clone()))
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Template not found: {}", template_id)))
}

#[derive(Debug, Deserialize)]
pub struct InstantiateRequest {
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

/// Instantiate a template and register the resulting workflow
pub async fn instantiate_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
    Json(req): Json<InstantiateRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowSummary>)> {
    let template_id = TemplateId::new(template_id);
    if state.templates.get(&template_id).is_none() {
        return Err(ApiError::NotFound(format!("Template not found: {}", template_id)));
    }

    let workflow = state.templates.instantiate(
        &template_id,
        &req.parameters,
        req.workflow_id.map(WorkflowId::new),
    )?;
    let registered = state.engine.register_workflow(workflow).await?;

    Ok((StatusCode::CREATED, Json(WorkflowSummary::from(&*registered))))
}

/// Statistics across all workflows
pub async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsOverview>> {
    Ok(Json(state.engine.statistics().await?))
}

/// Statistics for one workflow
pub async fn get_workflow_stats(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowStats>> {
    let stats = state
        .engine
        .workflow_statistics(&WorkflowId::new(workflow_id))
        .await?;
    Ok(Json(stats))
}
