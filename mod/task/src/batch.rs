use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use prewarm_cluster::WorkerLauncher;
use prewarm_core::metrics::WORKER_CREATION_TOTAL;
use prewarm_core::ServiceError;

/// Batch size used when a task carries a non-positive value.
pub const DEFAULT_BATCH_SIZE: i64 = 10;

/// Pause after large batches to limit orchestrator-API pressure.
const LARGE_BATCH_PAUSE: Duration = Duration::from_secs(2);

/// Batches above this size trigger the pause.
const LARGE_BATCH_THRESHOLD: usize = 10;

/// Partition `nodes` into contiguous chunks of `batch_size` (the last chunk
/// may be smaller). Concatenating the result reproduces the input.
pub fn split_batches(nodes: &[String], batch_size: i64) -> Vec<Vec<String>> {
    let size = if batch_size <= 0 {
        DEFAULT_BATCH_SIZE as usize
    } else {
        batch_size as usize
    };
    nodes.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

/// Number of batches: ceil(total_nodes / batch_size).
pub fn calculate_batches(total_nodes: i64, batch_size: i64) -> Result<i64, ServiceError> {
    if batch_size <= 0 {
        return Err(ServiceError::Validation(
            "batch size must be greater than 0".into(),
        ));
    }
    if total_nodes <= 0 {
        return Err(ServiceError::Validation(
            "total nodes must be greater than 0".into(),
        ));
    }
    Ok((total_nodes + batch_size - 1) / batch_size)
}

/// Launches per-node workers batch by batch.
pub struct BatchScheduler {
    launcher: Arc<WorkerLauncher>,
}

impl BatchScheduler {
    pub fn new(launcher: Arc<WorkerLauncher>) -> Self {
        Self { launcher }
    }

    /// Create workers for every node, one sequential batch at a time.
    ///
    /// Worker-creation failures are counted and reported through
    /// `on_batch(batch_number, succeeded, failed)`; they never abort the
    /// batch. Cancellation between batches aborts before the next batch
    /// starts.
    pub async fn execute_batches(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
        nodes: &[String],
        images: &[String],
        cred_secret: Option<&str>,
        batch_size: i64,
        mut on_batch: impl FnMut(i64, usize, usize),
    ) -> Result<(), ServiceError> {
        let batches = split_batches(nodes, batch_size);

        info!(
            task_id,
            total_nodes = nodes.len(),
            total_batches = batches.len(),
            batch_size,
            "starting batch execution"
        );

        for (i, batch) in batches.iter().enumerate() {
            let batch_num = (i + 1) as i64;

            info!(task_id, batch_num, nodes = batch.len(), "executing batch");

            let (succeeded, failed) = self
                .execute_batch(cancel, task_id, batch, images, cred_secret)
                .await;

            info!(task_id, batch_num, succeeded, failed, "batch submitted");
            on_batch(batch_num, succeeded, failed);

            if cancel.is_cancelled() {
                warn!(task_id, "batch execution cancelled");
                return Err(ServiceError::Cancelled("batch execution cancelled".into()));
            }
        }

        Ok(())
    }

    /// Create a worker per node in this batch, pausing afterwards when the
    /// batch was large.
    async fn execute_batch(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
        nodes: &[String],
        images: &[String],
        cred_secret: Option<&str>,
    ) -> (usize, usize) {
        let mut succeeded = 0;
        let mut failed = 0;

        for node in nodes {
            match self
                .launcher
                .create_worker(task_id, node, images, cred_secret)
                .await
            {
                Ok(()) => {
                    counter!(WORKER_CREATION_TOTAL, "status" => "success").increment(1);
                    succeeded += 1;
                }
                Err(e) => {
                    error!(task_id, node = %node, error = %e, "failed to create worker");
                    counter!(WORKER_CREATION_TOTAL, "status" => "failed").increment(1);
                    failed += 1;
                }
            }
        }

        if nodes.len() > LARGE_BATCH_THRESHOLD {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(LARGE_BATCH_PAUSE) => {}
            }
        }

        (succeeded, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prewarm_cluster::{LauncherConfig, MemoryCluster};

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{i}")).collect()
    }

    fn scheduler(cluster: Arc<MemoryCluster>) -> BatchScheduler {
        BatchScheduler::new(Arc::new(WorkerLauncher::new(
            cluster,
            LauncherConfig {
                puller_image: "crictl:test".into(),
                cri_socket_path: "/run/containerd/containerd.sock".into(),
            },
        )))
    }

    #[test]
    fn split_is_size_bounded_and_lossless() {
        let input = nodes(7);
        let batches = split_batches(&input, 3);
        assert_eq!(batches.len(), 3);
        for batch in &batches[..batches.len() - 1] {
            assert_eq!(batch.len(), 3);
        }
        assert_eq!(batches.last().unwrap().len(), 1);

        let rejoined: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn split_falls_back_to_default_size() {
        let input = nodes(25);
        let batches = split_batches(&input, 0);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), DEFAULT_BATCH_SIZE as usize);
    }

    #[test]
    fn calculate_is_ceiling_division() {
        assert_eq!(calculate_batches(10, 3).unwrap(), 4);
        assert_eq!(calculate_batches(9, 3).unwrap(), 3);
        assert_eq!(calculate_batches(1, 100).unwrap(), 1);
        assert_eq!(calculate_batches(5, 2).unwrap(), 3);
    }

    #[test]
    fn calculate_rejects_non_positive_inputs() {
        assert!(calculate_batches(0, 3).is_err());
        assert!(calculate_batches(-1, 3).is_err());
        assert!(calculate_batches(10, 0).is_err());
        assert!(calculate_batches(10, -2).is_err());
    }

    #[tokio::test]
    async fn creates_workers_and_reports_batches() {
        let cluster = Arc::new(MemoryCluster::new());
        let scheduler = scheduler(cluster.clone());
        let cancel = CancellationToken::new();

        let mut reports = Vec::new();
        scheduler
            .execute_batches(
                &cancel,
                "t1",
                &nodes(5),
                &["nginx:1".into()],
                None,
                2,
                |batch, ok, failed| reports.push((batch, ok, failed)),
            )
            .await
            .unwrap();

        assert_eq!(reports, vec![(1, 2, 0), (2, 2, 0), (3, 1, 0)]);
        assert_eq!(cluster.worker_names("t1").len(), 5);
    }

    #[tokio::test]
    async fn worker_failures_are_counted_not_fatal() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.break_node("node-1");
        let scheduler = scheduler(cluster.clone());
        let cancel = CancellationToken::new();

        let mut reports = Vec::new();
        scheduler
            .execute_batches(
                &cancel,
                "t1",
                &nodes(3),
                &["nginx:1".into()],
                None,
                3,
                |batch, ok, failed| reports.push((batch, ok, failed)),
            )
            .await
            .unwrap();

        assert_eq!(reports, vec![(1, 2, 1)]);
        assert_eq!(cluster.worker_names("t1").len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_batch() {
        let cluster = Arc::new(MemoryCluster::new());
        let scheduler = scheduler(cluster.clone());
        let cancel = CancellationToken::new();

        let cancel_in_callback = cancel.clone();
        let err = scheduler
            .execute_batches(
                &cancel,
                "t1",
                &nodes(6),
                &["nginx:1".into()],
                None,
                2,
                move |_, _, _| cancel_in_callback.cancel(),
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        // Only the first batch ran.
        assert_eq!(cluster.worker_names("t1").len(), 2);
    }
}
