use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use prewarm_cluster::{ClusterApi, WorkerPhase};
use prewarm_core::metrics::{IMAGE_PREWARM_STATUS, NODES_PROCESSED, TASKS_TOTAL};
use prewarm_core::{now_rfc3339, ServiceError};

use crate::model::{FailedNode, TaskStatus, SUCCESS_RATE_THRESHOLD};
use crate::store::TaskStore;

/// Intervals driving the reconciler.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Reconcile at least this often while the watch is healthy.
    pub liveness_interval: Duration,
    /// Reconcile cadence on the polling fallback.
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Reconciles worker outcomes into task state until the task is terminal.
///
/// The watch stream is an optimisation: events only mean "reconcile now".
/// All state derives from listing workers and reading their results, so the
/// polling fallback is equally correct, just slower.
pub struct StatusTracker {
    store: Arc<TaskStore>,
    cluster: Arc<dyn ClusterApi>,
    config: TrackerConfig,
}

impl StatusTracker {
    pub fn new(store: Arc<TaskStore>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self::with_config(store, cluster, TrackerConfig::default())
    }

    pub fn with_config(
        store: Arc<TaskStore>,
        cluster: Arc<dyn ClusterApi>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store,
            cluster,
            config,
        }
    }

    /// Block until the task reaches a terminal state or `cancel` fires.
    pub async fn track_task(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
    ) -> Result<(), ServiceError> {
        info!(task_id, "starting task tracking");

        match self.track_with_watch(cancel, task_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(task_id, error = %e, "watch tracking failed, falling back to polling");
                self.track_with_polling(cancel, task_id).await
            }
        }
    }

    async fn track_with_watch(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
    ) -> Result<(), ServiceError> {
        let mut events = self
            .cluster
            .watch_workers(task_id)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to open worker watch: {e}")))?;

        info!(task_id, "using watch for task tracking");

        let mut tick = tokio::time::interval(self.config.liveness_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(task_id, "task tracking cancelled");
                    return Err(ServiceError::Cancelled("task tracking cancelled".into()));
                }
                event = events.recv() => match event {
                    Some(event) => {
                        debug!(task_id, ?event, "received worker event");
                        if self.reconcile_logged(task_id).await {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(ServiceError::Unavailable("worker watch stream closed".into()));
                    }
                },
                _ = tick.tick() => {
                    if self.reconcile_logged(task_id).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn track_with_polling(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
    ) -> Result<(), ServiceError> {
        info!(task_id, "using polling for task tracking");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(task_id, "task tracking cancelled");
                    return Err(ServiceError::Cancelled("task tracking cancelled".into()));
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if self.reconcile_logged(task_id).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run one reconcile pass, logging failures instead of aborting the
    /// tracking loop. Returns true when the task is terminal.
    async fn reconcile_logged(&self, task_id: &str) -> bool {
        match self.reconcile(task_id).await {
            Ok(terminal) => {
                if terminal {
                    info!(task_id, "task tracking completed");
                }
                terminal
            }
            Err(e) => {
                error!(task_id, error = %e, "failed to reconcile task");
                false
            }
        }
    }

    /// Map the current worker set onto the task record.
    ///
    /// Safe to call from either the watch loop or the poll loop, any number
    /// of times; every pass rebuilds the derived fields from the worker
    /// list.
    pub async fn reconcile(&self, task_id: &str) -> Result<bool, ServiceError> {
        let mut task = self.store.get(task_id)?;
        if task.status.is_terminal() {
            return Ok(true);
        }

        let workers = self
            .cluster
            .list_workers(task_id)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to list workers: {e}")))?;

        // No workers yet: leave the task in pending/running as-is.
        if workers.is_empty() {
            return Ok(false);
        }

        let mut completed: i64 = 0;
        let mut failed: i64 = 0;
        let mut running: i64 = 0;
        let mut failed_nodes = Vec::new();

        for worker in &workers {
            match worker.phase {
                WorkerPhase::Succeeded => {
                    completed += 1;
                    if !task.node_statuses.contains_key(&worker.node) {
                        if let Some(results) = self.read_results(&worker.name).await? {
                            for (image, status) in &results {
                                let outcome = if *status == 1 { "success" } else { "failed" };
                                counter!(
                                    IMAGE_PREWARM_STATUS,
                                    "node" => worker.node.clone(),
                                    "image" => image.clone(),
                                    "status" => outcome,
                                )
                                .increment(1);
                            }
                            task.node_statuses.insert(worker.node.clone(), results);
                        }
                    }
                }
                WorkerPhase::Failed => {
                    failed += 1;
                    failed_nodes.push(FailedNode {
                        node_name: worker.node.clone(),
                        reason: "JobFailed".into(),
                        message: worker.message.clone().unwrap_or_default(),
                        timestamp: now_rfc3339(),
                    });
                }
                WorkerPhase::Pending | WorkerPhase::Running => running += 1,
            }
        }

        let progress = task.progress.get_or_insert_with(Default::default);
        progress.completed_nodes = completed;
        progress.failed_nodes = failed;
        let total = progress.total_nodes;
        task.failed_nodes = failed_nodes;
        task.calculate_progress();

        let mut terminal = false;
        if total > 0 && completed + failed >= total {
            task.finished_at = Some(now_rfc3339());
            let success_rate = completed as f64 / total as f64;
            task.status = if success_rate >= SUCCESS_RATE_THRESHOLD {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };

            counter!(TASKS_TOTAL, "status" => task.status.as_str()).increment(1);
            counter!(NODES_PROCESSED, "status" => "success").increment(completed as u64);
            counter!(NODES_PROCESSED, "status" => "failed").increment(failed as u64);

            info!(
                task_id,
                status = %task.status,
                completed,
                failed,
                success_rate,
                "task finished"
            );
            terminal = true;
        } else if running > 0 && task.status == TaskStatus::Pending {
            task.status = TaskStatus::Running;
            if task.started_at.is_none() {
                task.started_at = Some(now_rfc3339());
            }
        }

        // A cancel that landed between our read and this write wins.
        if !self.store.update_if_not_cancelled(&task)? {
            return Ok(true);
        }
        Ok(terminal)
    }

    /// Parse one worker's termination message, if present.
    async fn read_results(
        &self,
        worker_name: &str,
    ) -> Result<Option<BTreeMap<String, i64>>, ServiceError> {
        let message = self
            .cluster
            .read_worker_result(worker_name)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to read worker result: {e}")))?;

        let Some(message) = message else {
            return Ok(None);
        };

        match serde_json::from_str::<BTreeMap<String, i64>>(&message) {
            Ok(results) => Ok(Some(results)),
            Err(e) => {
                warn!(worker = worker_name, error = %e, "unparseable termination message");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{sample_task, Progress, Task};
    use prewarm_cluster::{MemoryCluster, WorkerSpec};
    use prewarm_sql::SqliteStore;

    fn fixture() -> (Arc<TaskStore>, Arc<MemoryCluster>, StatusTracker) {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Arc::new(TaskStore::new(db).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let tracker = StatusTracker::with_config(
            store.clone(),
            cluster.clone(),
            TrackerConfig {
                liveness_interval: Duration::from_millis(50),
                poll_interval: Duration::from_millis(50),
            },
        );
        (store, cluster, tracker)
    }

    fn running_task(store: &TaskStore, total_nodes: i64) -> Task {
        let mut task = sample_task();
        task.status = TaskStatus::Running;
        task.started_at = Some(now_rfc3339());
        task.progress = Some(Progress {
            total_nodes,
            total_batches: 1,
            ..Default::default()
        });
        task.calculate_progress();
        store.create(&task).unwrap();
        task
    }

    async fn add_worker(cluster: &MemoryCluster, task_id: &str, node: &str) -> String {
        let name = format!("prewarm-{task_id}-{node}");
        cluster
            .create_worker(&WorkerSpec {
                name: name.clone(),
                task_id: task_id.into(),
                node: node.into(),
                images: vec!["nginx:1".into()],
                cred_secret: None,
                puller_image: "crictl:test".into(),
                cri_socket_path: "/run/containerd/containerd.sock".into(),
                ttl_seconds: 900,
            })
            .await
            .unwrap();
        name
    }

    #[tokio::test]
    async fn reconcile_without_workers_is_a_no_op() {
        let (store, _cluster, tracker) = fixture();
        let task = running_task(&store, 2);

        assert!(!tracker.reconcile(&task.id).await.unwrap());
        let after = store.get(&task.id).unwrap();
        assert_eq!(after.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn all_nodes_succeeding_completes_the_task() {
        let (store, cluster, tracker) = fixture();
        let task = running_task(&store, 2);

        for node in ["n1", "n2"] {
            let name = add_worker(&cluster, &task.id, node).await;
            cluster.complete_worker(&name, r#"{"nginx:1":1}"#);
        }

        assert!(tracker.reconcile(&task.id).await.unwrap());
        let after = store.get(&task.id).unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
        assert!(after.finished_at.is_some());

        let progress = after.progress.unwrap();
        assert_eq!(progress.completed_nodes, 2);
        assert_eq!(progress.failed_nodes, 0);
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(after.node_statuses["n1"]["nginx:1"], 1);
        assert_eq!(after.node_statuses["n2"]["nginx:1"], 1);
    }

    #[tokio::test]
    async fn ninety_percent_success_still_completes() {
        let (store, cluster, tracker) = fixture();
        let task = running_task(&store, 10);

        for i in 0..9 {
            let name = add_worker(&cluster, &task.id, &format!("ok-{i}")).await;
            cluster.complete_worker(&name, r#"{"nginx:1":1}"#);
        }
        let bad = add_worker(&cluster, &task.id, "bad").await;
        cluster.fail_worker(&bad, "pull timed out");

        assert!(tracker.reconcile(&task.id).await.unwrap());
        let after = store.get(&task.id).unwrap();
        assert_eq!(after.status, TaskStatus::Completed);

        let progress = after.progress.unwrap();
        assert_eq!(progress.completed_nodes, 9);
        assert_eq!(progress.failed_nodes, 1);
        assert_eq!(after.failed_nodes.len(), 1);
        assert_eq!(after.failed_nodes[0].node_name, "bad");
        assert_eq!(after.failed_nodes[0].reason, "JobFailed");
        assert_eq!(after.failed_nodes[0].message, "pull timed out");
    }

    #[tokio::test]
    async fn below_threshold_fails_the_task() {
        let (store, cluster, tracker) = fixture();
        let task = running_task(&store, 10);

        for i in 0..8 {
            let name = add_worker(&cluster, &task.id, &format!("ok-{i}")).await;
            cluster.complete_worker(&name, r#"{"nginx:1":1}"#);
        }
        for i in 0..2 {
            let name = add_worker(&cluster, &task.id, &format!("bad-{i}")).await;
            cluster.fail_worker(&name, "no space left on device");
        }

        assert!(tracker.reconcile(&task.id).await.unwrap());
        let after = store.get(&task.id).unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.failed_nodes.len(), 2);
    }

    #[tokio::test]
    async fn processed_nodes_partition_without_duplicates() {
        let (store, cluster, tracker) = fixture();
        let task = running_task(&store, 2);

        let ok = add_worker(&cluster, &task.id, "n1").await;
        cluster.complete_worker(&ok, r#"{"nginx:1":1}"#);
        let bad = add_worker(&cluster, &task.id, "n2").await;
        cluster.fail_worker(&bad, "boom");

        // Two passes: the second must not duplicate records.
        tracker.reconcile(&task.id).await.unwrap();
        let after = store.get(&task.id).unwrap();
        assert_eq!(after.node_statuses.len(), 1);
        assert_eq!(after.failed_nodes.len(), 1);
        let progress = after.progress.unwrap();
        assert_eq!(progress.completed_nodes + progress.failed_nodes, 2);
    }

    #[tokio::test]
    async fn termination_message_reserialises_identically() {
        let (store, cluster, tracker) = fixture();
        let task = running_task(&store, 1);

        let message = r#"{"alpine:3.20":0,"nginx:1":1}"#;
        let name = add_worker(&cluster, &task.id, "n1").await;
        cluster.complete_worker(&name, message);

        tracker.reconcile(&task.id).await.unwrap();
        let after = store.get(&task.id).unwrap();
        assert_eq!(
            serde_json::to_string(&after.node_statuses["n1"]).unwrap(),
            message
        );
    }

    #[tokio::test]
    async fn track_task_finishes_via_watch() {
        let (store, cluster, tracker) = fixture();
        let task = running_task(&store, 1);
        let cancel = CancellationToken::new();

        let name = add_worker(&cluster, &task.id, "n1").await;
        let cluster_bg = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cluster_bg.complete_worker(&name, r#"{"nginx:1":1}"#);
        });

        tokio::time::timeout(Duration::from_secs(2), tracker.track_task(&cancel, &task.id))
            .await
            .expect("tracking timed out")
            .unwrap();
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn track_task_falls_back_to_polling() {
        let (store, cluster, tracker) = fixture();
        cluster.refuse_watch();
        let task = running_task(&store, 1);
        let cancel = CancellationToken::new();

        let name = add_worker(&cluster, &task.id, "n1").await;
        cluster.complete_worker(&name, r#"{"nginx:1":1}"#);

        tokio::time::timeout(Duration::from_secs(2), tracker.track_task(&cancel, &task.id))
            .await
            .expect("tracking timed out")
            .unwrap();
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_aborts_tracking() {
        let (store, _cluster, tracker) = fixture();
        let task = running_task(&store, 1);
        let cancel = CancellationToken::new();

        let cancel_bg = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_bg.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), tracker.track_task(&cancel, &task.id))
            .await
            .expect("tracking timed out")
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
