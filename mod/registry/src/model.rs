use serde::{Deserialize, Serialize};

/// A stored private-registry credential.
///
/// The password is kept in the store but never serialised into API
/// responses — listings go through [`SecretListItem`].
#[derive(Debug, Clone)]
pub struct RegistrySecret {
    pub id: i64,
    pub name: String,
    pub registry: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
    pub updated_at: String,
}

impl RegistrySecret {
    pub fn to_list_item(&self) -> SecretListItem {
        SecretListItem {
            id: self.id,
            name: self.name.clone(),
            registry: self.registry.clone(),
            username: self.username.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Credential view without the password.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretListItem {
    pub id: i64,
    pub name: String,
    pub registry: String,
    pub username: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Body for `POST /secrets`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    pub name: String,
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// Body for `PUT /secrets/{id}`. An empty password keeps the stored one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSecretRequest {
    pub name: String,
    pub registry: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A saved image in the library.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryImage {
    pub id: i64,
    pub name: String,
    pub image: String,
    pub created_at: String,
}

/// Body for `POST /library`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveImageRequest {
    pub name: String,
    pub image: String,
}
