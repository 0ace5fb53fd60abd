use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use prewarm_core::ServiceError;

use crate::manager::TaskManager;
use crate::model::{CreateTaskRequest, ListTasksQuery, Task};

type ManagerState = Arc<TaskManager>;

pub fn router(manager: Arc<TaskManager>) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .with_state(manager)
}

// ---------------------------------------------------------------------------
// POST /tasks
// ---------------------------------------------------------------------------

async fn create_task(
    State(manager): State<ManagerState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ServiceError> {
    let task = manager.create_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

// ---------------------------------------------------------------------------
// GET /tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(manager): State<ManagerState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let (page, limit, offset) = manager.list_tasks(query.offset, query.limit)?;
    Ok(Json(serde_json::json!({
        "tasks": page.items,
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

// ---------------------------------------------------------------------------
// GET /tasks/:id
// ---------------------------------------------------------------------------

async fn get_task(
    State(manager): State<ManagerState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServiceError> {
    Ok(Json(manager.get_task(&id)?))
}

// ---------------------------------------------------------------------------
// DELETE /tasks/:id
// ---------------------------------------------------------------------------

async fn delete_task(
    State(manager): State<ManagerState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let action = manager.delete_task(&id).await?;
    Ok(Json(serde_json::json!({ "action": action })))
}
