use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::{info, warn};

use prewarm_cluster::ClusterApi;
use prewarm_core::ServiceError;

use crate::model::{Claims, LoginResponse, User, UserRole};
use crate::store::UserStore;

const TOKEN_TTL_SECS: i64 = 24 * 3600;

/// Hash a plain password with argon2id.
pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ServiceError::Internal(format!("password hash failed: {e}")))
}

/// Verify a password against an argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Login, token issuance, and the three-step bearer validation: local JWT,
/// stored static API token, then the cluster's token review endpoint
/// (which yields a viewer-role identity).
pub struct AuthService {
    users: Arc<UserStore>,
    cluster: Arc<dyn ClusterApi>,
    jwt_secret: Vec<u8>,
}

impl AuthService {
    pub fn new(users: Arc<UserStore>, cluster: Arc<dyn ClusterApi>, jwt_secret: &str) -> Arc<Self> {
        Arc::new(Self {
            users,
            cluster,
            jwt_secret: jwt_secret.as_bytes().to_vec(),
        })
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    /// Create the default admin account when no admin exists yet.
    pub fn ensure_admin_user(&self) -> Result<(), ServiceError> {
        if self.users.get_by_username("admin")?.is_some() {
            return Ok(());
        }
        let hash = hash_password("admin123")?;
        self.users.create_user("admin", &hash, UserRole::Admin)?;
        warn!("default admin user created (admin/admin123) — change the password");
        Ok(())
    }

    /// Verify username/password and issue a session token.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ServiceError> {
        let user = self
            .users
            .get_by_username(username)?
            .filter(|user| verify_password(password, &user.password_hash))
            .ok_or_else(|| ServiceError::Unauthorized("invalid username or password".into()))?;

        let token = self.issue_jwt(&user)?;
        info!(username, "user logged in");
        Ok(LoginResponse { token, user })
    }

    fn issue_jwt(&self, user: &User) -> Result<String, ServiceError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            name: user.username.clone(),
            role: user.role.as_str().to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| ServiceError::Internal(format!("JWT encode failed: {e}")))
    }

    /// Resolve a bearer token to an identity, trying JWT, static API
    /// token, and cluster token review in that order.
    pub async fn validate_token(&self, token: &str) -> Result<(String, UserRole), ServiceError> {
        if let Some(identity) = self.validate_jwt(token) {
            return Ok(identity);
        }
        if let Some(identity) = self.validate_static_token(token)? {
            return Ok(identity);
        }
        if let Some(identity) = self.validate_cluster_token(token).await? {
            return Ok(identity);
        }
        Err(ServiceError::Unauthorized("invalid token".into()))
    }

    fn validate_jwt(&self, token: &str) -> Option<(String, UserRole)> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &Validation::default(),
        )
        .ok()?;
        let role = UserRole::from_str(&data.claims.role)?;
        Some((data.claims.name, role))
    }

    fn validate_static_token(&self, token: &str) -> Result<Option<(String, UserRole)>, ServiceError> {
        let Some(stored) = self.users.get_token(token)? else {
            return Ok(None);
        };
        if let Some(expires_at) = &stored.expires_at {
            if let Ok(expiry) = chrono::DateTime::parse_from_rfc3339(expires_at) {
                if expiry < chrono::Utc::now() {
                    return Err(ServiceError::Unauthorized("token expired".into()));
                }
            }
        }
        let user = self.users.get_user(stored.user_id)?;
        Ok(Some((user.username, user.role)))
    }

    async fn validate_cluster_token(
        &self,
        token: &str,
    ) -> Result<Option<(String, UserRole)>, ServiceError> {
        match self.cluster.review_token(token).await {
            // Cluster-authenticated callers are always viewers.
            Ok(Some(username)) => Ok(Some((username, UserRole::Viewer))),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "cluster token review unavailable");
                Ok(None)
            }
        }
    }
}
