use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};

use prewarm_auth::CurrentUser;
use prewarm_core::ServiceError;

use crate::engine::ScheduleEngine;
use crate::model::{
    CreateScheduledTaskRequest, ListQuery, ScheduledExecution, ScheduledTask,
    UpdateScheduledTaskRequest,
};

type EngineState = Arc<ScheduleEngine>;

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

pub fn router(engine: Arc<ScheduleEngine>) -> Router {
    Router::new()
        .route(
            "/scheduled-tasks",
            get(list_scheduled_tasks).post(create_scheduled_task),
        )
        .route(
            "/scheduled-tasks/{id}",
            get(get_scheduled_task)
                .put(update_scheduled_task)
                .delete(delete_scheduled_task),
        )
        .route("/scheduled-tasks/{id}/enable", put(enable_task))
        .route("/scheduled-tasks/{id}/disable", put(disable_task))
        .route("/scheduled-tasks/{id}/trigger", post(trigger_task))
        .route("/scheduled-tasks/{id}/executions", get(list_executions))
        .route(
            "/scheduled-tasks/{id}/executions/{execution_id}",
            get(get_execution),
        )
        .with_state(engine)
}

fn clamp_page(query: &ListQuery) -> (i64, i64) {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(0, MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    (offset, limit)
}

async fn create_scheduled_task(
    State(engine): State<EngineState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateScheduledTaskRequest>,
) -> Result<(StatusCode, Json<ScheduledTask>), ServiceError> {
    let task = engine.create_scheduled_task(req, &user.username)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_scheduled_tasks(
    State(engine): State<EngineState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let (offset, limit) = clamp_page(&query);
    let page = engine.list_scheduled_tasks(offset, limit)?;
    Ok(Json(serde_json::json!({
        "tasks": page.items,
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn get_scheduled_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, ServiceError> {
    Ok(Json(engine.get_scheduled_task(&id)?))
}

async fn update_scheduled_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateScheduledTaskRequest>,
) -> Result<Json<ScheduledTask>, ServiceError> {
    Ok(Json(engine.update_scheduled_task(&id, req)?))
}

async fn delete_scheduled_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    engine.delete_scheduled_task(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn enable_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, ServiceError> {
    engine.enable_task(&id)?;
    Ok(Json(engine.get_scheduled_task(&id)?))
}

async fn disable_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<ScheduledTask>, ServiceError> {
    engine.disable_task(&id)?;
    Ok(Json(engine.get_scheduled_task(&id)?))
}

async fn trigger_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let task_id = engine.trigger_task(&id).await?;
    Ok(Json(serde_json::json!({ "taskId": task_id })))
}

async fn list_executions(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let (offset, limit) = clamp_page(&query);
    let page = engine.list_executions(&id, offset, limit)?;
    Ok(Json(serde_json::json!({
        "executions": page.items,
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn get_execution(
    State(engine): State<EngineState>,
    Path((id, execution_id)): Path<(String, i64)>,
) -> Result<Json<ScheduledExecution>, ServiceError> {
    let execution = engine.get_execution(execution_id)?;
    if execution.scheduled_task_id != id {
        return Err(ServiceError::NotFound(format!(
            "scheduled execution {execution_id}"
        )));
    }
    Ok(Json(execution))
}
