use std::sync::Arc;

use tracing::debug;

use crate::api::{ClusterApi, ClusterError};
use crate::model::{Worker, WorkerSpec};

/// Label applied to every object this service creates.
pub const APP_LABEL: &str = "image-prewarm";

/// Finished workers are kept for 15 minutes, then expire.
pub const WORKER_TTL_SECONDS: u32 = 900;

/// Static configuration for worker creation.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub puller_image: String,
    pub cri_socket_path: String,
}

/// Creates and removes per-(task, node) workers and their credential
/// bundles through the orchestrator API.
pub struct WorkerLauncher {
    cluster: Arc<dyn ClusterApi>,
    config: LauncherConfig,
}

/// Deterministic worker name for a (task, node) pair.
pub fn worker_name(task_id: &str, node: &str) -> String {
    format!("prewarm-{task_id}-{node}")
}

/// Deterministic credential bundle name for a task.
pub fn cred_bundle_name(task_id: &str) -> String {
    format!("registry-creds-{task_id}")
}

impl WorkerLauncher {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: LauncherConfig) -> Self {
        Self { cluster, config }
    }

    /// Access the underlying cluster API (for the tracker's watch/result reads).
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    /// Create one worker that pulls `images` on `node`.
    ///
    /// The worker runs the puller helper once (no retries), mounts the
    /// node's CRI socket, and receives the image list comma-joined in its
    /// environment. When `cred_secret` is set, the worker reads
    /// `REGISTRY_CREDS` from that bundle.
    pub async fn create_worker(
        &self,
        task_id: &str,
        node: &str,
        images: &[String],
        cred_secret: Option<&str>,
    ) -> Result<(), ClusterError> {
        let spec = WorkerSpec {
            name: worker_name(task_id, node),
            task_id: task_id.to_string(),
            node: node.to_string(),
            images: images.to_vec(),
            cred_secret: cred_secret.map(|s| s.to_string()),
            puller_image: self.config.puller_image.clone(),
            cri_socket_path: self.config.cri_socket_path.clone(),
            ttl_seconds: WORKER_TTL_SECONDS,
        };

        debug!(task_id, node, worker = %spec.name, "creating worker");
        self.cluster.create_worker(&spec).await
    }

    pub async fn delete_worker(&self, name: &str) -> Result<(), ClusterError> {
        self.cluster.delete_worker(name).await
    }

    pub async fn list_workers(&self, task_id: &str) -> Result<Vec<Worker>, ClusterError> {
        self.cluster.list_workers(task_id).await
    }

    /// Create the short-lived credential bundle for a task. The bundle
    /// carries a single `user:pass` string for the runtime's pull command.
    pub async fn create_cred_bundle(
        &self,
        task_id: &str,
        username: &str,
        password: &str,
    ) -> Result<String, ClusterError> {
        let name = cred_bundle_name(task_id);
        let credentials = format!("{username}:{password}");
        self.cluster.create_secret(&name, task_id, &credentials).await?;
        debug!(task_id, bundle = %name, "credential bundle created");
        Ok(name)
    }

    pub async fn delete_cred_bundle(&self, name: &str) -> Result<(), ClusterError> {
        self.cluster.delete_secret(name).await
    }

    /// All credential bundles that exist, as (name, task id) pairs.
    pub async fn list_cred_bundles(&self) -> Result<Vec<(String, String)>, ClusterError> {
        self.cluster.list_secrets().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::model::WorkerPhase;

    fn launcher(cluster: Arc<MemoryCluster>) -> WorkerLauncher {
        WorkerLauncher::new(
            cluster,
            LauncherConfig {
                puller_image: "crictl:test".into(),
                cri_socket_path: "/run/containerd/containerd.sock".into(),
            },
        )
    }

    #[tokio::test]
    async fn create_and_list_workers() {
        let cluster = Arc::new(MemoryCluster::new());
        let launcher = launcher(cluster.clone());

        launcher
            .create_worker("task-1", "node-a", &["nginx:1".into()], None)
            .await
            .unwrap();
        launcher
            .create_worker("task-1", "node-b", &["nginx:1".into()], None)
            .await
            .unwrap();
        launcher
            .create_worker("task-2", "node-a", &["redis:7".into()], None)
            .await
            .unwrap();

        let workers = launcher.list_workers("task-1").await.unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.phase == WorkerPhase::Running));
        assert!(workers.iter().any(|w| w.name == "prewarm-task-1-node-a"));
    }

    #[tokio::test]
    async fn duplicate_worker_rejected() {
        let cluster = Arc::new(MemoryCluster::new());
        let launcher = launcher(cluster);

        launcher
            .create_worker("task-1", "node-a", &["nginx:1".into()], None)
            .await
            .unwrap();
        let err = launcher
            .create_worker("task-1", "node-a", &["nginx:1".into()], None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn cred_bundle_lifecycle() {
        let cluster = Arc::new(MemoryCluster::new());
        let launcher = launcher(cluster.clone());

        let name = launcher
            .create_cred_bundle("task-9", "bob", "s3cret")
            .await
            .unwrap();
        assert_eq!(name, "registry-creds-task-9");
        assert_eq!(
            cluster.secret_value(&name).as_deref(),
            Some("bob:s3cret")
        );

        launcher.delete_cred_bundle(&name).await.unwrap();
        assert!(cluster.secret_value(&name).is_none());
    }
}
