use std::sync::Arc;

use prewarm_core::{now_rfc3339, ServiceError};
use prewarm_sql::{Row, SQLStore, Value};

use crate::model::{LibraryImage, RegistrySecret};

const SECRET_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registry_secrets (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    registry    TEXT NOT NULL,
    username    TEXT NOT NULL,
    password    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

/// Persistent storage for registry credentials.
pub struct SecretStore {
    db: Arc<dyn SQLStore>,
}

impl SecretStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SECRET_SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("registry secret schema init: {e}")))?;
        Ok(Self { db })
    }

    pub fn create(
        &self,
        name: &str,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<RegistrySecret, ServiceError> {
        let now = now_rfc3339();
        self.db
            .exec(
                "INSERT INTO registry_secrets (name, registry, username, password, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    Value::Text(name.to_string()),
                    Value::Text(registry.to_string()),
                    Value::Text(username.to_string()),
                    Value::Text(password.to_string()),
                    Value::Text(now.clone()),
                    Value::Text(now.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let id = last_insert_id(self.db.as_ref())?;
        Ok(RegistrySecret {
            id,
            name: name.to_string(),
            registry: registry.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, id: i64) -> Result<RegistrySecret, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, registry, username, password, created_at, updated_at \
                 FROM registry_secrets WHERE id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("registry secret {id}")))?;
        row_to_secret(row)
    }

    pub fn update(
        &self,
        id: i64,
        name: &str,
        registry: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<RegistrySecret, ServiceError> {
        let existing = self.get(id)?;
        let password = match password {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => existing.password,
        };
        let now = now_rfc3339();
        self.db
            .exec(
                "UPDATE registry_secrets SET name = ?1, registry = ?2, username = ?3, \
                 password = ?4, updated_at = ?5 WHERE id = ?6",
                &[
                    Value::Text(name.to_string()),
                    Value::Text(registry.to_string()),
                    Value::Text(username.to_string()),
                    Value::Text(password),
                    Value::Text(now),
                    Value::Integer(id),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        self.get(id)
    }

    pub fn delete(&self, id: i64) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM registry_secrets WHERE id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("registry secret {id}")));
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<RegistrySecret>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, registry, username, password, created_at, updated_at \
                 FROM registry_secrets ORDER BY created_at DESC",
                &[],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.iter().map(row_to_secret).collect()
    }
}

fn row_to_secret(row: &Row) -> Result<RegistrySecret, ServiceError> {
    Ok(RegistrySecret {
        id: row
            .get_i64("id")
            .ok_or_else(|| ServiceError::Storage("missing id column".into()))?,
        name: row.get_str("name").unwrap_or_default().to_string(),
        registry: row.get_str("registry").unwrap_or_default().to_string(),
        username: row.get_str("username").unwrap_or_default().to_string(),
        password: row.get_str("password").unwrap_or_default().to_string(),
        created_at: row.get_str("created_at").unwrap_or_default().to_string(),
        updated_at: row.get_str("updated_at").unwrap_or_default().to_string(),
    })
}

const LIBRARY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS library_images (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    image       TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);
";

/// Persistent storage for the saved image library.
pub struct LibraryStore {
    db: Arc<dyn SQLStore>,
}

impl LibraryStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(LIBRARY_SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("library schema init: {e}")))?;
        Ok(Self { db })
    }

    pub fn save(&self, name: &str, image: &str) -> Result<LibraryImage, ServiceError> {
        let now = now_rfc3339();
        self.db
            .exec(
                "INSERT INTO library_images (name, image, created_at) VALUES (?1, ?2, ?3)",
                &[
                    Value::Text(name.to_string()),
                    Value::Text(image.to_string()),
                    Value::Text(now.clone()),
                ],
            )
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint") {
                    ServiceError::Conflict(format!("image {image} already saved"))
                } else {
                    ServiceError::Storage(msg)
                }
            })?;
        let id = last_insert_id(self.db.as_ref())?;
        Ok(LibraryImage {
            id,
            name: name.to_string(),
            image: image.to_string(),
            created_at: now,
        })
    }

    pub fn delete(&self, id: i64) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM library_images WHERE id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("library image {id}")));
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<LibraryImage>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, image, created_at FROM library_images ORDER BY created_at DESC",
                &[],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.iter()
            .map(|row| {
                Ok(LibraryImage {
                    id: row
                        .get_i64("id")
                        .ok_or_else(|| ServiceError::Storage("missing id column".into()))?,
                    name: row.get_str("name").unwrap_or_default().to_string(),
                    image: row.get_str("image").unwrap_or_default().to_string(),
                    created_at: row.get_str("created_at").unwrap_or_default().to_string(),
                })
            })
            .collect()
    }
}

/// Id of the row inserted by the previous statement on this connection.
fn last_insert_id(db: &dyn SQLStore) -> Result<i64, ServiceError> {
    let rows = db
        .query("SELECT last_insert_rowid() AS id", &[])
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    rows.first()
        .and_then(|r| r.get_i64("id"))
        .ok_or_else(|| ServiceError::Storage("missing last insert id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prewarm_sql::SqliteStore;

    fn secret_store() -> SecretStore {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        SecretStore::new(db).unwrap()
    }

    #[test]
    fn secret_crud() {
        let store = secret_store();
        let created = store
            .create("harbor", "harbor.example.com", "bot", "hunter2")
            .unwrap();
        assert_eq!(created.id, 1);

        let got = store.get(created.id).unwrap();
        assert_eq!(got.registry, "harbor.example.com");
        assert_eq!(got.password, "hunter2");

        // Empty password on update keeps the stored one.
        let updated = store
            .update(created.id, "harbor-2", "harbor.example.com", "bot", None)
            .unwrap();
        assert_eq!(updated.name, "harbor-2");
        assert_eq!(updated.password, "hunter2");

        store.delete(created.id).unwrap();
        assert!(store.get(created.id).is_err());
    }

    #[test]
    fn list_item_hides_password() {
        let store = secret_store();
        let created = store.create("a", "r", "u", "p").unwrap();
        let json = serde_json::to_string(&created.to_list_item()).unwrap();
        assert!(!json.contains("\"password\""));
        assert!(!json.contains('p') || !json.contains("\"p\""));
    }

    #[test]
    fn library_rejects_duplicates() {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = LibraryStore::new(db).unwrap();
        store.save("nginx", "nginx:1.27").unwrap();
        let err = store.save("nginx again", "nginx:1.27").unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
