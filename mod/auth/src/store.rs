use std::sync::Arc;

use prewarm_core::{now_rfc3339, ServiceError};
use prewarm_sql::{Row, SQLStore, Value};

use crate::model::{ApiToken, User, UserRole};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT NOT NULL UNIQUE,
    password    TEXT NOT NULL,
    role        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS api_tokens (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL,
    name        TEXT NOT NULL,
    token       TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL,
    expires_at  TEXT,
    FOREIGN KEY(user_id) REFERENCES users(id)
);
";

/// Persistent storage for users and static API tokens.
pub struct UserStore {
    db: Arc<dyn SQLStore>,
}

impl UserStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("user schema init: {e}")))?;
        Ok(Self { db })
    }

    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: UserRole,
    ) -> Result<User, ServiceError> {
        let now = now_rfc3339();
        self.db
            .exec(
                "INSERT INTO users (username, password, role, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[
                    Value::Text(username.to_string()),
                    Value::Text(password_hash.to_string()),
                    Value::Text(role.as_str().to_string()),
                    Value::Text(now.clone()),
                    Value::Text(now.clone()),
                ],
            )
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint") {
                    ServiceError::Conflict(format!("user {username} already exists"))
                } else {
                    ServiceError::Storage(msg)
                }
            })?;

        let id = self.last_insert_id()?;
        Ok(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            role,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_user(&self, id: i64) -> Result<User, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, username, password, role, created_at, updated_at \
                 FROM users WHERE id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("user {id}")))?;
        row_to_user(row)
    }

    pub fn get_by_username(&self, username: &str) -> Result<Option<User>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, username, password, role, created_at, updated_at \
                 FROM users WHERE username = ?1",
                &[Value::Text(username.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        match rows.first() {
            Some(row) => Ok(Some(row_to_user(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_password(&self, id: i64, password_hash: &str) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "UPDATE users SET password = ?1, updated_at = ?2 WHERE id = ?3",
                &[
                    Value::Text(password_hash.to_string()),
                    Value::Text(now_rfc3339()),
                    Value::Integer(id),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    /// Delete a user and any API tokens issued to them.
    pub fn delete_user(&self, id: i64) -> Result<(), ServiceError> {
        self.db
            .exec(
                "DELETE FROM api_tokens WHERE user_id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let affected = self
            .db
            .exec("DELETE FROM users WHERE id = ?1", &[Value::Integer(id)])
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<User>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, username, password, role, created_at, updated_at \
                 FROM users ORDER BY id ASC",
                &[],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.iter().map(row_to_user).collect()
    }

    // -----------------------------------------------------------------------
    // API tokens
    // -----------------------------------------------------------------------

    pub fn create_token(
        &self,
        user_id: i64,
        name: &str,
        token: &str,
        expires_at: Option<&str>,
    ) -> Result<ApiToken, ServiceError> {
        let now = now_rfc3339();
        self.db
            .exec(
                "INSERT INTO api_tokens (user_id, name, token, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[
                    Value::Integer(user_id),
                    Value::Text(name.to_string()),
                    Value::Text(token.to_string()),
                    Value::Text(now.clone()),
                    match expires_at {
                        Some(ts) => Value::Text(ts.to_string()),
                        None => Value::Null,
                    },
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let id = self.last_insert_id()?;
        Ok(ApiToken {
            id,
            user_id,
            name: name.to_string(),
            token: token.to_string(),
            created_at: now,
            expires_at: expires_at.map(|s| s.to_string()),
        })
    }

    pub fn get_token(&self, token: &str) -> Result<Option<ApiToken>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, user_id, name, token, created_at, expires_at \
                 FROM api_tokens WHERE token = ?1",
                &[Value::Text(token.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(ApiToken {
            id: row
                .get_i64("id")
                .ok_or_else(|| ServiceError::Storage("missing id column".into()))?,
            user_id: row.get_i64("user_id").unwrap_or(0),
            name: row.get_str("name").unwrap_or_default().to_string(),
            token: row.get_str("token").unwrap_or_default().to_string(),
            created_at: row.get_str("created_at").unwrap_or_default().to_string(),
            expires_at: row.get_str("expires_at").map(|s| s.to_string()),
        }))
    }

    fn last_insert_id(&self) -> Result<i64, ServiceError> {
        let rows = self
            .db
            .query("SELECT last_insert_rowid() AS id", &[])
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.first()
            .and_then(|r| r.get_i64("id"))
            .ok_or_else(|| ServiceError::Storage("missing last insert id".into()))
    }
}

fn row_to_user(row: &Row) -> Result<User, ServiceError> {
    let role = row
        .get_str("role")
        .and_then(UserRole::from_str)
        .ok_or_else(|| ServiceError::Storage("bad role column".into()))?;
    Ok(User {
        id: row
            .get_i64("id")
            .ok_or_else(|| ServiceError::Storage("missing id column".into()))?,
        username: row.get_str("username").unwrap_or_default().to_string(),
        password_hash: row.get_str("password").unwrap_or_default().to_string(),
        role,
        created_at: row.get_str("created_at").unwrap_or_default().to_string(),
        updated_at: row.get_str("updated_at").unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prewarm_sql::SqliteStore;

    fn store() -> UserStore {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        UserStore::new(db).unwrap()
    }

    #[test]
    fn user_crud() {
        let store = store();
        let user = store.create_user("alice", "hash-a", UserRole::Admin).unwrap();
        assert_eq!(user.id, 1);

        let by_name = store.get_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        assert_eq!(by_name.role, UserRole::Admin);

        assert!(store.get_by_username("nobody").unwrap().is_none());

        store.update_password(user.id, "hash-b").unwrap();
        assert_eq!(store.get_user(user.id).unwrap().password_hash, "hash-b");

        store.delete_user(user.id).unwrap();
        assert!(store.get_user(user.id).is_err());
    }

    #[test]
    fn duplicate_username_is_conflict() {
        let store = store();
        store.create_user("bob", "h", UserRole::Viewer).unwrap();
        let err = store.create_user("bob", "h2", UserRole::Viewer).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn token_lookup() {
        let store = store();
        let user = store.create_user("ci", "h", UserRole::Viewer).unwrap();
        store
            .create_token(user.id, "pipeline", "tok-123", None)
            .unwrap();

        let token = store.get_token("tok-123").unwrap().unwrap();
        assert_eq!(token.user_id, user.id);
        assert!(token.expires_at.is_none());
        assert!(store.get_token("other").unwrap().is_none());
    }
}
