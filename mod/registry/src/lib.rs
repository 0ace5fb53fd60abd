//! Registry module — stored private-registry credentials and the saved
//! image library.

pub mod api;
pub mod model;
pub mod store;

pub use model::{CreateSecretRequest, LibraryImage, RegistrySecret, SecretListItem};
pub use store::{LibraryStore, SecretStore};
