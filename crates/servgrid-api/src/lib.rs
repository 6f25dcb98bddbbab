//! servgrid-api: REST API for ServGrid.
//!
//! Exposes the service operations of a [`Node`] plus task, group and node
//! records over axum. Every response uses the `{success, data, error}`
//! envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | List snapshots (`task`, `group`, `environment`, `running`) |
//! | POST | `/api/v1/services` | Create from a configuration (`start=true` to start it) |
//! | GET | `/api/v1/services/count` | Count services (`task`, `group`) |
//! | GET | `/api/v1/services/{id}` | Snapshot by unique id or name |
//! | DELETE | `/api/v1/services/{id}` | Delete a service |
//! | POST | `/api/v1/services/{id}/start` | Start |
//! | POST | `/api/v1/services/{id}/stop` | Stop |
//! | POST | `/api/v1/services/{id}/restart` | Restart |
//! | POST | `/api/v1/services/{id}/command` | Write a console command |
//! | POST | `/api/v1/services/{id}/templates` | Queue a template |
//! | POST | `/api/v1/services/{id}/templates/include` | Copy waiting templates |
//! | POST | `/api/v1/services/{id}/inclusions` | Queue a remote inclusion |
//! | POST | `/api/v1/services/{id}/deployments` | Queue a deployment |
//! | POST | `/api/v1/services/{id}/deployments/execute` | Run waiting deployments |
//! | GET | `/api/v1/services/{id}/logs` | Cached console lines |
//! | POST | `/api/v1/services/{id}/snapshot` | Refresh the snapshot |
//! | GET | `/api/v1/tasks` | List tasks |
//! | PUT | `/api/v1/tasks/{name}` | Store a task |
//! | POST | `/api/v1/tasks/{name}/services` | Select or create a service and start it |
//! | GET | `/api/v1/groups` | List groups |
//! | PUT | `/api/v1/groups/{name}` | Store a group |
//! | GET | `/api/v1/nodes` | Cluster members |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use servgrid_scheduler::Node;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<Node>,
}

/// Build the API router.
pub fn build_router(node: Arc<Node>) -> Router {
    let state = ApiState { node };

    let api_routes = Router::new()
        .route("/services", get(handlers::list_services).post(handlers::create_service))
        .route("/services/count", get(handlers::count_services))
        .route("/services/{id}", get(handlers::get_service).delete(handlers::delete_service))
        .route("/services/{id}/start", post(handlers::start_service))
        .route("/services/{id}/stop", post(handlers::stop_service))
        .route("/services/{id}/restart", post(handlers::restart_service))
        .route("/services/{id}/command", post(handlers::run_command))
        .route("/services/{id}/templates", post(handlers::add_template))
        .route("/services/{id}/templates/include", post(handlers::include_templates))
        .route("/services/{id}/inclusions", post(handlers::add_inclusion))
        .route("/services/{id}/deployments", post(handlers::add_deployment))
        .route("/services/{id}/deployments/execute", post(handlers::execute_deployments))
        .route("/services/{id}/logs", get(handlers::cached_logs))
        .route("/services/{id}/snapshot", post(handlers::update_snapshot))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{name}", put(handlers::put_task))
        .route("/tasks/{name}/services", post(handlers::start_task_service))
        .route("/groups", get(handlers::list_groups))
        .route("/groups/{name}", put(handlers::put_group))
        .route("/nodes", get(handlers::list_nodes))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
