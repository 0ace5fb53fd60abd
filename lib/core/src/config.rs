use std::env;
use std::path::PathBuf;

/// Process configuration, read from environment variables.
///
/// Every field has a documented default so the service starts in a dev
/// environment with no configuration at all.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Namespace workers and credential bundles are created in.
    /// Env: `K8S_NAMESPACE` (default `default`).
    pub namespace: String,

    /// Path to the SQLite database file.
    /// Env: `SQLITE_DB_PATH` (default `ips.db`).
    pub sqlite_path: PathBuf,

    /// Image used for worker carriers. Accepted for deployment
    /// compatibility; the worker container runs `puller_image`.
    /// Env: `WORKER_IMAGE`.
    pub worker_image: String,

    /// Image containing the puller helper.
    /// Env: `PULLER_IMAGE`.
    pub puller_image: String,

    /// Container-runtime socket path mounted into workers.
    /// Env: `CRI_SOCKET_PATH` (default `/run/containerd/containerd.sock`).
    pub cri_socket_path: String,

    /// JWT signing secret. Env: `JWT_SECRET`.
    pub jwt_secret: String,

    /// True when `JWT_SECRET` was not set and the built-in dev secret is
    /// in use. The binary logs a warning in that case.
    pub jwt_secret_is_default: bool,

    /// HTTP listen port. Env: `SERVER_PORT` (default `8080`).
    pub server_port: u16,
}

pub const DEFAULT_WORKER_IMAGE: &str = "registry.k8s.io/pause:3.10";
pub const DEFAULT_PULLER_IMAGE: &str = "registry.k8s.io/build-containers/crictl:v1.31.0";
pub const DEFAULT_CRI_SOCKET: &str = "/run/containerd/containerd.sock";

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            sqlite_path: PathBuf::from("ips.db"),
            worker_image: DEFAULT_WORKER_IMAGE.to_string(),
            puller_image: DEFAULT_PULLER_IMAGE.to_string(),
            cri_socket_path: DEFAULT_CRI_SOCKET.to_string(),
            jwt_secret: "prewarm-default-secret-change-me".to_string(),
            jwt_secret_is_default: true,
            server_port: 8080,
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = ServiceConfig::default();

        if let Some(ns) = non_empty(env::var("K8S_NAMESPACE")) {
            config.namespace = ns;
        }
        if let Some(path) = non_empty(env::var("SQLITE_DB_PATH")) {
            config.sqlite_path = PathBuf::from(path);
        }
        if let Some(image) = non_empty(env::var("WORKER_IMAGE")) {
            config.worker_image = image;
        }
        if let Some(image) = non_empty(env::var("PULLER_IMAGE")) {
            config.puller_image = image;
        }
        if let Some(path) = non_empty(env::var("CRI_SOCKET_PATH")) {
            config.cri_socket_path = path;
        }
        if let Some(secret) = non_empty(env::var("JWT_SECRET")) {
            config.jwt_secret = secret;
            config.jwt_secret_is_default = false;
        }
        if let Some(port) = non_empty(env::var("SERVER_PORT")) {
            if let Ok(port) = port.parse() {
                config.server_port = port;
            }
        }

        config
    }

    /// Listen address for the HTTP server.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server_port)
    }
}

fn non_empty(var: Result<String, env::VarError>) -> Option<String> {
    match var {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.sqlite_path, PathBuf::from("ips.db"));
        assert_eq!(config.cri_socket_path, DEFAULT_CRI_SOCKET);
        assert_eq!(config.server_port, 8080);
        assert!(config.jwt_secret_is_default);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }
}
