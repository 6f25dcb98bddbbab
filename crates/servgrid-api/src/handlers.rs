//! REST API handlers.
//!
//! Service handlers go through the node's registry, so they work the same
//! for local services and services owned by other nodes. Task and group
//! handlers read and write the state store.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use servgrid_cluster::{OperationOutcome, ServiceOperation};
use servgrid_scheduler::{ServiceFilter, ServiceProvider};
use servgrid_state::{
    GroupConfiguration, ServiceConfiguration, ServiceCreateResult, ServiceDeployment,
    ServiceLifecycle, ServiceRemoteInclusion, ServiceTask, ServiceTemplate, StateError,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn state_error(e: StateError) -> Response {
    let status = match e {
        StateError::InvalidName(_) => StatusCode::BAD_REQUEST,
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Find a provider by unique id, falling back to the service name.
fn lookup(state: &ApiState, id_or_name: &str) -> Option<ServiceProvider> {
    match Uuid::parse_str(id_or_name) {
        Ok(unique_id) => state.node.provider(unique_id),
        Err(_) => state.node.provider_by_name(id_or_name),
    }
}

/// Run `operation` on the service and render its outcome.
async fn operate(state: &ApiState, id_or_name: &str, operation: ServiceOperation) -> Response {
    let Some(provider) = lookup(state, id_or_name) else {
        return error_response("service not found", StatusCode::NOT_FOUND);
    };
    debug!(service = %id_or_name, ?operation, "api operation");
    match provider.execute(operation).await {
        Some(OperationOutcome::Snapshot { snapshot: Some(snapshot) }) => {
            ApiResponse::ok(*snapshot).into_response()
        }
        Some(OperationOutcome::Snapshot { snapshot: None }) => {
            error_response("service not found on its node", StatusCode::NOT_FOUND)
        }
        Some(OperationOutcome::Toggled { enabled }) => ApiResponse::ok(enabled).into_response(),
        Some(OperationOutcome::LogLines { lines }) => ApiResponse::ok(lines).into_response(),
        None => error_response("owning node did not answer", StatusCode::BAD_GATEWAY),
    }
}

fn creation_response(result: ServiceCreateResult) -> Response {
    match result {
        ServiceCreateResult::Created { snapshot } => {
            (StatusCode::CREATED, ApiResponse::ok(*snapshot)).into_response()
        }
        ServiceCreateResult::Deferred { creation_id } => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "creation_id": creation_id })),
        )
            .into_response(),
        ServiceCreateResult::Failed => {
            error_response("service could not be created", StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

// ── Services ───────────────────────────────────────────────────

/// Query of the service listing.
#[derive(Debug, Default, Deserialize)]
pub struct ServiceQuery {
    pub task: Option<String>,
    pub group: Option<String>,
    pub environment: Option<String>,
    #[serde(default)]
    pub running: bool,
}

/// GET /api/v1/services
pub async fn list_services(
    State(state): State<ApiState>,
    Query(query): Query<ServiceQuery>,
) -> impl IntoResponse {
    let filter = ServiceFilter {
        task: query.task,
        group: query.group,
        environment: query.environment,
        lifecycle: query.running.then_some(ServiceLifecycle::Running),
        ..ServiceFilter::default()
    };
    ApiResponse::ok(state.node.registry().services_matching(&filter))
}

#[derive(Debug, Default, Deserialize)]
pub struct CountQuery {
    pub task: Option<String>,
    pub group: Option<String>,
}

/// GET /api/v1/services/count
pub async fn count_services(
    State(state): State<ApiState>,
    Query(query): Query<CountQuery>,
) -> impl IntoResponse {
    let filter = ServiceFilter {
        task: query.task,
        group: query.group,
        ..ServiceFilter::default()
    };
    ApiResponse::ok(state.node.registry().services_matching(&filter).len())
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateQuery {
    #[serde(default)]
    pub start: bool,
}

/// POST /api/v1/services
pub async fn create_service(
    State(state): State<ApiState>,
    Query(query): Query<CreateQuery>,
    Json(configuration): Json<ServiceConfiguration>,
) -> impl IntoResponse {
    let result = if query.start {
        state.node.create_and_start(&configuration).await
    } else {
        state.node.create_service(&configuration).await
    };
    creation_response(result)
}

/// GET /api/v1/services/{id}
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match lookup(&state, &id) {
        Some(provider) => ApiResponse::ok(provider.snapshot()).into_response(),
        None => error_response("service not found", StatusCode::NOT_FOUND),
    }
}

/// DELETE /api/v1/services/{id}
pub async fn delete_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::Delete).await
}

/// POST /api/v1/services/{id}/start
pub async fn start_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::Start).await
}

/// POST /api/v1/services/{id}/stop
pub async fn stop_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::Stop).await
}

/// POST /api/v1/services/{id}/restart
pub async fn restart_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::Restart).await
}

/// Console command body.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub line: String,
}

/// POST /api/v1/services/{id}/command
pub async fn run_command(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::RunCommand { line: req.line }).await
}

/// POST /api/v1/services/{id}/templates
pub async fn add_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(template): Json<ServiceTemplate>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::AddTemplate { template }).await
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/v1/services/{id}/templates/include
pub async fn include_templates(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> impl IntoResponse {
    let operation = ServiceOperation::IncludeWaitingTemplates { force: query.force };
    operate(&state, &id, operation).await
}

/// POST /api/v1/services/{id}/inclusions
pub async fn add_inclusion(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(inclusion): Json<ServiceRemoteInclusion>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::AddInclusion { inclusion }).await
}

/// POST /api/v1/services/{id}/deployments
pub async fn add_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(deployment): Json<ServiceDeployment>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::AddDeployment { deployment }).await
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteQuery {
    #[serde(default)]
    pub remove: bool,
}

/// POST /api/v1/services/{id}/deployments/execute
pub async fn execute_deployments(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ExecuteQuery>,
) -> impl IntoResponse {
    let operation = ServiceOperation::DeployResources {
        remove_deployments: query.remove,
    };
    operate(&state, &id, operation).await
}

/// GET /api/v1/services/{id}/logs
pub async fn cached_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::CachedLogLines).await
}

/// POST /api/v1/services/{id}/snapshot
pub async fn update_snapshot(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    operate(&state, &id, ServiceOperation::ForceUpdateSnapshot).await
}

// ── Tasks ──────────────────────────────────────────────────────

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>) -> impl IntoResponse {
    match state.node.store().list_tasks() {
        Ok(tasks) => ApiResponse::ok(tasks).into_response(),
        Err(e) => state_error(e),
    }
}

/// PUT /api/v1/tasks/{name}
pub async fn put_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(mut task): Json<ServiceTask>,
) -> impl IntoResponse {
    task.name = name;
    match state.node.store().put_task(&task) {
        Ok(()) => ApiResponse::ok(task).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/tasks/{name}/services
pub async fn start_task_service(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let task = match state.node.store().get_task(&name) {
        Ok(Some(task)) => task,
        Ok(None) => return error_response("task not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(e),
    };

    let result = state.node.select_or_create_service(&task).await;
    let ServiceCreateResult::Created { snapshot } = result else {
        return creation_response(result);
    };
    match state.node.provider(snapshot.unique_id()) {
        Some(provider) => match provider.start().await {
            Some(started) => creation_response(ServiceCreateResult::created(started)),
            None => error_response("owning node did not answer", StatusCode::BAD_GATEWAY),
        },
        None => creation_response(ServiceCreateResult::Created { snapshot }),
    }
}

// ── Groups ─────────────────────────────────────────────────────

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    match state.node.store().list_groups() {
        Ok(groups) => ApiResponse::ok(groups).into_response(),
        Err(e) => state_error(e),
    }
}

/// PUT /api/v1/groups/{name}
pub async fn put_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(mut group): Json<GroupConfiguration>,
) -> impl IntoResponse {
    group.name = name;
    match state.node.store().put_group(&group) {
        Ok(()) => ApiResponse::ok(group).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.node.membership().list_members() {
        Ok(members) => ApiResponse::ok(members).into_response(),
        Err(e) => state_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_outcomes_map_to_status_codes() {
        assert_eq!(
            creation_response(ServiceCreateResult::Deferred {
                creation_id: Uuid::new_v4()
            })
            .status(),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            creation_response(ServiceCreateResult::Failed).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn state_errors_map_to_status_codes() {
        assert_eq!(
            state_error(StateError::InvalidName("a b".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            state_error(StateError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
