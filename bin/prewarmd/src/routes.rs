//! Route composition: public system endpoints, the authenticated
//! `/api/v1` surface, and the admin-only scheduled-task tier.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use prewarm_auth::{auth_middleware, require_admin, AuthService};
use prewarm_cluster::{filter_ready_nodes, ClusterApi};
use prewarm_core::{now_rfc3339, ServiceError};
use prewarm_registry::{LibraryStore, SecretStore};
use prewarm_schedule::ScheduleEngine;
use prewarm_task::TaskManager;

/// Everything the router needs, wired up by `main`.
pub struct AppContext {
    pub auth: Arc<AuthService>,
    pub tasks: Arc<TaskManager>,
    pub engine: Arc<ScheduleEngine>,
    pub secrets: Arc<SecretStore>,
    pub library: Arc<LibraryStore>,
    pub cluster: Arc<dyn ClusterApi>,
    pub metrics: PrometheusHandle,
}

pub fn build_router(ctx: AppContext) -> Router {
    // Admin tier: scheduled-task management.
    let admin = prewarm_schedule::api::router(ctx.engine)
        .route_layer(axum::middleware::from_fn(require_admin));

    // Authenticated tier.
    let protected = Router::new()
        .merge(prewarm_task::api::router(ctx.tasks))
        .merge(prewarm_registry::api::router(ctx.secrets, ctx.library))
        .merge(prewarm_auth::api::user_router(ctx.auth.clone()))
        .merge(admin)
        .route_layer(axum::middleware::from_fn_with_state(
            ctx.auth.clone(),
            auth_middleware,
        ));

    let api_v1 = Router::new()
        .merge(prewarm_auth::api::login_router(ctx.auth))
        .route("/stats", get(stats).with_state(ctx.cluster))
        .merge(protected);

    let metrics_handle = ctx.metrics;
    Router::new()
        .nest("/api/v1", api_v1)
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": now_rfc3339(),
    }))
}

async fn ready() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ready",
        "timestamp": now_rfc3339(),
    }))
}

/// Node coverage summary for the dashboard.
async fn stats(
    State(cluster): State<Arc<dyn ClusterApi>>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let nodes = cluster
        .list_nodes(&BTreeMap::new())
        .await
        .map_err(|e| ServiceError::Unavailable(format!("failed to get nodes: {e}")))?;
    let ready = filter_ready_nodes(&nodes);

    Ok(Json(serde_json::json!({
        "nodes": {
            "total": nodes.len(),
            "ready": ready.len(),
            "coverage": ready.len(),
        },
    })))
}
