//! Auth module — users, static API tokens, JWT sessions, and the bearer
//! middleware protecting the HTTP API.

pub mod api;
pub mod middleware;
pub mod model;
pub mod service;
pub mod store;

pub use middleware::{auth_middleware, require_admin, CurrentUser};
pub use model::{User, UserRole};
pub use service::AuthService;
pub use store::UserStore;
