use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};

use prewarm_core::ServiceError;

use crate::model::{CreateSecretRequest, SaveImageRequest, SecretListItem, UpdateSecretRequest};
use crate::store::{LibraryStore, SecretStore};

#[derive(Clone)]
pub struct RegistryState {
    pub secrets: Arc<SecretStore>,
    pub library: Arc<LibraryStore>,
}

pub fn router(secrets: Arc<SecretStore>, library: Arc<LibraryStore>) -> Router {
    Router::new()
        .route("/secrets", get(list_secrets).post(create_secret))
        .route(
            "/secrets/{id}",
            get(get_secret).put(update_secret).delete(delete_secret),
        )
        .route("/library", get(list_images).post(save_image))
        .route("/library/{id}", delete(delete_image))
        .with_state(RegistryState { secrets, library })
}

async fn list_secrets(
    State(state): State<RegistryState>,
) -> Result<Json<Vec<SecretListItem>>, ServiceError> {
    let secrets = state.secrets.list()?;
    Ok(Json(secrets.iter().map(|s| s.to_list_item()).collect()))
}

async fn create_secret(
    State(state): State<RegistryState>,
    Json(req): Json<CreateSecretRequest>,
) -> Result<Json<SecretListItem>, ServiceError> {
    if req.name.is_empty() || req.registry.is_empty() || req.username.is_empty() {
        return Err(ServiceError::Validation(
            "name, registry and username are required".into(),
        ));
    }
    if req.password.is_empty() {
        return Err(ServiceError::Validation("password is required".into()));
    }
    let secret = state
        .secrets
        .create(&req.name, &req.registry, &req.username, &req.password)?;
    Ok(Json(secret.to_list_item()))
}

async fn get_secret(
    State(state): State<RegistryState>,
    Path(id): Path<i64>,
) -> Result<Json<SecretListItem>, ServiceError> {
    Ok(Json(state.secrets.get(id)?.to_list_item()))
}

async fn update_secret(
    State(state): State<RegistryState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSecretRequest>,
) -> Result<Json<SecretListItem>, ServiceError> {
    let password = if req.password.is_empty() {
        None
    } else {
        Some(req.password.as_str())
    };
    let secret = state
        .secrets
        .update(id, &req.name, &req.registry, &req.username, password)?;
    Ok(Json(secret.to_list_item()))
}

async fn delete_secret(
    State(state): State<RegistryState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.secrets.delete(id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn list_images(
    State(state): State<RegistryState>,
) -> Result<Json<Vec<crate::model::LibraryImage>>, ServiceError> {
    Ok(Json(state.library.list()?))
}

async fn save_image(
    State(state): State<RegistryState>,
    Json(req): Json<SaveImageRequest>,
) -> Result<Json<crate::model::LibraryImage>, ServiceError> {
    if req.image.is_empty() {
        return Err(ServiceError::Validation("image is required".into()));
    }
    Ok(Json(state.library.save(&req.name, &req.image)?))
}

async fn delete_image(
    State(state): State<RegistryState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.library.delete(id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
