use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use prewarm_cluster::{filter_ready_nodes, ClusterApi};
use prewarm_core::ServiceError;

/// Resolves a node selector to the set of eligible node names.
pub struct NodeFilter {
    cluster: Arc<dyn ClusterApi>,
}

impl NodeFilter {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Nodes matching `selector` (empty = all) that are ready and
    /// schedulable, in listing order. An empty result is an error: a task
    /// with nowhere to run has failed, and may be retried.
    pub async fn filter_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ServiceError> {
        let nodes = self
            .cluster
            .list_nodes(selector)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to list nodes: {e}")))?;

        let ready = filter_ready_nodes(&nodes);
        debug!(
            matched = nodes.len(),
            eligible = ready.len(),
            "node filter evaluated"
        );

        if ready.is_empty() {
            return Err(ServiceError::Unavailable("no ready nodes found".into()));
        }

        Ok(ready)
    }
}
