use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{Node, Worker, WorkerEvent, WorkerSpec};

/// Orchestrator API failure.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Api(String),
}

/// The orchestrator-API surface the control plane depends on.
///
/// Production uses [`crate::HttpCluster`]; tests use
/// [`crate::MemoryCluster`]. All methods take effect in the configured
/// namespace of the implementation.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// List nodes matching the label selector (empty = all nodes), in the
    /// orchestrator's listing order.
    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Node>, ClusterError>;

    /// Create a worker. Fails if a worker with the same name exists.
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), ClusterError>;

    /// Delete a worker and its dependents.
    async fn delete_worker(&self, name: &str) -> Result<(), ClusterError>;

    /// All workers labelled with the given task id.
    async fn list_workers(&self, task_id: &str) -> Result<Vec<Worker>, ClusterError>;

    /// The termination message written by a finished worker's puller
    /// container, if any.
    async fn read_worker_result(&self, worker_name: &str) -> Result<Option<String>, ClusterError>;

    /// Open an event stream over workers labelled with the given task id.
    /// The channel closes when the underlying stream ends.
    async fn watch_workers(
        &self,
        task_id: &str,
    ) -> Result<mpsc::Receiver<WorkerEvent>, ClusterError>;

    /// Create an opaque secret holding registry credentials, labelled with
    /// the task id for crash-recovery sweeps.
    async fn create_secret(
        &self,
        name: &str,
        task_id: &str,
        credentials: &str,
    ) -> Result<(), ClusterError>;

    /// Delete a secret. Deleting a missing secret is not an error.
    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError>;

    /// All secrets this service created, as (name, task-id label) pairs.
    /// Used by the crash-recovery sweep for orphaned credential bundles.
    async fn list_secrets(&self) -> Result<Vec<(String, String)>, ClusterError>;

    /// Validate a bearer token against the cluster's token review endpoint.
    /// Returns the authenticated username, or `None` when rejected.
    async fn review_token(&self, token: &str) -> Result<Option<String>, ClusterError>;
}
