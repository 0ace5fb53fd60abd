//! Bearer-token middleware and role checks.
//!
//! The middleware validates `Authorization: Bearer <token>` against
//! [`AuthService`] and stores the resolved [`CurrentUser`] in request
//! extensions for downstream handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use prewarm_core::ServiceError;

use crate::model::UserRole;
use crate::service::AuthService;

/// Identity resolved by the middleware.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub role: UserRole,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Require a valid bearer token and attach the identity to the request.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ServiceError::Unauthorized("authorization bearer token required".into()))?;

    let (username, role) = auth.validate_token(token).await?;
    request
        .extensions_mut()
        .insert(CurrentUser { username, role });

    Ok(next.run(request).await)
}

/// Reject non-admin callers. Applied as a second layer on admin routes,
/// after [`auth_middleware`] has populated the identity.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, ServiceError> {
    let user = request
        .extensions()
        .get::<CurrentUser>()
        .ok_or_else(|| ServiceError::Unauthorized("user context not found".into()))?;

    if !user.is_admin() {
        return Err(ServiceError::PermissionDenied(
            "insufficient role: admin required".into(),
        ));
    }

    Ok(next.run(request).await)
}
