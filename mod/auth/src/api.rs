use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};

use prewarm_core::ServiceError;

use crate::middleware::CurrentUser;
use crate::model::{CreateUserRequest, LoginRequest, LoginResponse, UpdateUserRequest, User};
use crate::service::{hash_password, AuthService};

type AuthState = Arc<AuthService>;

/// The public login route.
pub fn login_router(auth: Arc<AuthService>) -> Router {
    Router::new()
        .route("/login", post(login))
        .with_state(auth)
}

/// User management routes, mounted behind the bearer middleware.
///
/// Listing, creation, and deletion are admin-only (checked in the
/// handlers); the password change allows self-service.
pub fn user_router(auth: Arc<AuthService>) -> Router {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", put(update_user).delete(delete_user))
        .with_state(auth)
}

fn admin_only(user: &CurrentUser) -> Result<(), ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::PermissionDenied(
            "insufficient role: admin required".into(),
        ));
    }
    Ok(())
}

async fn login(
    State(auth): State<AuthState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServiceError> {
    Ok(Json(auth.login(&req.username, &req.password)?))
}

async fn list_users(
    State(auth): State<AuthState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<User>>, ServiceError> {
    admin_only(&current)?;
    Ok(Json(auth.users().list_users()?))
}

async fn create_user(
    State(auth): State<AuthState>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<User>, ServiceError> {
    admin_only(&current)?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ServiceError::Validation(
            "username and password are required".into(),
        ));
    }
    let hash = hash_password(&req.password)?;
    Ok(Json(auth.users().create_user(&req.username, &hash, req.role)?))
}

/// Password change. Admins may change anyone's password; other users only
/// their own.
async fn update_user(
    State(auth): State<AuthState>,
    Path(id): Path<i64>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let target = auth.users().get_user(id)?;
    if !current.is_admin() && current.username != target.username {
        return Err(ServiceError::PermissionDenied(
            "cannot change another user's password".into(),
        ));
    }
    if req.password.is_empty() {
        return Err(ServiceError::Validation("password is required".into()));
    }
    let hash = hash_password(&req.password)?;
    auth.users().update_password(id, &hash)?;
    Ok(Json(serde_json::json!({ "updated": true })))
}

async fn delete_user(
    State(auth): State<AuthState>,
    Path(id): Path<i64>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    admin_only(&current)?;
    let target = auth.users().get_user(id)?;
    if current.username == target.username {
        return Err(ServiceError::Validation(
            "cannot delete the account you are logged in as".into(),
        ));
    }
    auth.users().delete_user(id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
