use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use prewarm_cluster::{ClusterApi, WorkerLauncher};
use prewarm_core::metrics::{ACTIVE_TASKS, TASKS_TOTAL, TASK_DURATION};
use prewarm_core::{now_rfc3339, ListResult, ServiceError};
use prewarm_registry::SecretStore;

use crate::batch::{calculate_batches, BatchScheduler};
use crate::filter::NodeFilter;
use crate::model::{generate_task_id, CreateTaskRequest, Progress, Task, TaskStatus};
use crate::queue::PriorityQueue;
use crate::retry::RetryStrategy;
use crate::store::TaskStore;
use crate::tracker::{StatusTracker, TrackerConfig};
use crate::webhook::WebhookNotifier;

/// Concurrency cap: tasks simultaneously past the pending→running gate.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;

/// Admission ceiling on the image list.
pub const MAX_IMAGES_PER_TASK: usize = 50;

const DEFAULT_PRIORITY: i64 = 5;
const DEFAULT_RETRY_DELAY_SECS: i64 = 30;
const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

/// What to do after a failed execution attempt.
enum FailureDisposition {
    /// Run again after the backoff delay.
    Retry(Duration),
    /// The task is now terminally failed.
    Terminal,
    /// Cancelled (or deleted) meanwhile; nothing left to do.
    Abandon,
}

/// Task admission, dispatch, cancellable execution, retry, and deletion.
///
/// Each admitted task is executed by exactly one spawned runner task, which
/// is the sole writer to the task record for its lifetime. The manager
/// owns the per-task cancellation handles; a handle is removed when its
/// runner exits.
pub struct TaskManager {
    store: Arc<TaskStore>,
    secrets: Arc<SecretStore>,
    launcher: Arc<WorkerLauncher>,
    filter: NodeFilter,
    batches: BatchScheduler,
    tracker: StatusTracker,
    webhooks: WebhookNotifier,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    queue: PriorityQueue,
    queued: Notify,
}

impl TaskManager {
    pub fn new(
        store: Arc<TaskStore>,
        secrets: Arc<SecretStore>,
        launcher: Arc<WorkerLauncher>,
        cluster: Arc<dyn ClusterApi>,
        max_concurrency: usize,
    ) -> Arc<Self> {
        Self::with_tracker_config(
            store,
            secrets,
            launcher,
            cluster,
            max_concurrency,
            TrackerConfig::default(),
        )
    }

    pub fn with_tracker_config(
        store: Arc<TaskStore>,
        secrets: Arc<SecretStore>,
        launcher: Arc<WorkerLauncher>,
        cluster: Arc<dyn ClusterApi>,
        max_concurrency: usize,
        tracker_config: TrackerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            filter: NodeFilter::new(cluster.clone()),
            batches: BatchScheduler::new(launcher.clone()),
            tracker: StatusTracker::with_config(store.clone(), cluster, tracker_config),
            webhooks: WebhookNotifier::new(),
            store,
            secrets,
            launcher,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            cancellations: Mutex::new(HashMap::new()),
            queue: PriorityQueue::new(),
            queued: Notify::new(),
        })
    }

    /// Access the underlying store (for API layer reads).
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Start the dispatcher. Queued tasks are popped in (priority desc,
    /// created_at asc) order; each pop spawns the task's execution runner,
    /// which then waits for a concurrency slot.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("task dispatcher started");
            loop {
                while let Some(task) = manager.queue.dequeue() {
                    manager.spawn_task(task).await;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("task dispatcher stopped");
                        break;
                    }
                    _ = manager.queued.notified() => {}
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Validate, default, persist, and queue a new task.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<Task, ServiceError> {
        validate_request(&req)?;

        let task = Task {
            id: generate_task_id(),
            status: TaskStatus::Pending,
            priority: req.priority.unwrap_or(DEFAULT_PRIORITY),
            images: req.images,
            batch_size: req.batch_size,
            node_selector: req.node_selector.unwrap_or_default(),
            progress: None,
            failed_nodes: Vec::new(),
            max_retries: req.max_retries.unwrap_or(0),
            retry_count: 0,
            retry_strategy: req
                .retry_strategy
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "linear".to_string()),
            retry_delay: req.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
            webhook_url: req.webhook_url.unwrap_or_default(),
            secret_id: req.secret_id,
            registry_auth: req.registry_auth,
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
            error_message: String::new(),
            node_statuses: Default::default(),
        };

        self.store.create(&task)?;
        counter!(TASKS_TOTAL, "status" => "pending").increment(1);
        gauge!(ACTIVE_TASKS).increment(1.0);

        info!(
            task_id = %task.id,
            priority = task.priority,
            images = task.images.len(),
            batch_size = task.batch_size,
            max_retries = task.max_retries,
            retry_strategy = %task.retry_strategy,
            "task created"
        );

        // Register the cancel handle before queueing so the task can be
        // cancelled while it is still waiting to be dispatched.
        self.cancellations
            .lock()
            .await
            .insert(task.id.clone(), CancellationToken::new());
        self.queue.enqueue(task.clone());
        self.queued.notify_one();

        Ok(task)
    }

    async fn spawn_task(self: &Arc<Self>, task: Task) {
        let token = match self.cancellations.lock().await.get(&task.id) {
            Some(token) => token.clone(),
            // Handle already gone: cancelled before dispatch.
            None => return,
        };

        let manager = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            manager.run_task(&task_id, token).await;
            manager.cancellations.lock().await.remove(&task_id);
        });
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// The task's execution runner: slot acquisition, the attempt loop,
    /// and terminal bookkeeping.
    async fn run_task(&self, task_id: &str, cancel: CancellationToken) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(task_id, "task cancelled while waiting for execution slot");
                return;
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        info!(
            task_id,
            max_concurrency = self.max_concurrency,
            "task acquired execution slot"
        );

        if cancel.is_cancelled() {
            return;
        }

        let started = Instant::now();
        loop {
            let failure = match self.execute_task(&cancel, task_id).await {
                Ok(TaskStatus::Completed) => {
                    self.finish_terminal(task_id, TaskStatus::Completed, started);
                    break;
                }
                Ok(TaskStatus::Cancelled) => break,
                // The tracker closed the run below the success threshold.
                Ok(_) => "success rate below completion threshold".to_string(),
                Err(e) if e.is_cancelled() => {
                    info!(task_id, "task context cancelled, skipping failure handling");
                    break;
                }
                Err(e) => e.to_string(),
            };

            match self.handle_failure(&cancel, task_id, &failure).await {
                FailureDisposition::Retry(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // A task cancelled during the backoff must not run again.
                    match self.store.get(task_id) {
                        Ok(task) if task.status == TaskStatus::Cancelled => break,
                        Ok(_) => {
                            info!(task_id, "retrying task");
                            continue;
                        }
                        Err(_) => break,
                    }
                }
                FailureDisposition::Terminal => {
                    self.finish_terminal(task_id, TaskStatus::Failed, started);
                    break;
                }
                FailureDisposition::Abandon => break,
            }
        }

        drop(permit);
        info!(task_id, "task execution context finished");
    }

    /// One execution attempt. `Ok` carries the terminal status the tracker
    /// reconciled to; `Err` is an infrastructure failure or cancellation.
    async fn execute_task(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
    ) -> Result<TaskStatus, ServiceError> {
        let mut task = self.store.get(task_id)?;
        if task.status == TaskStatus::Cancelled {
            return Err(ServiceError::Cancelled("task already cancelled".into()));
        }

        info!(task_id, "starting task execution");

        let nodes = self.filter.filter_nodes(&task.node_selector).await?;
        info!(task_id, node_count = nodes.len(), "nodes filtered");

        let total_batches = calculate_batches(nodes.len() as i64, task.batch_size)?;
        task.progress = Some(Progress {
            total_nodes: nodes.len() as i64,
            total_batches,
            ..Default::default()
        });
        // A fresh attempt starts with a clean outcome map.
        task.node_statuses.clear();
        task.failed_nodes.clear();

        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled("task cancelled before launch".into()));
        }

        task.status = TaskStatus::Running;
        if task.started_at.is_none() {
            task.started_at = Some(now_rfc3339());
        }
        if !self.store.update_if_not_cancelled(&task)? {
            return Err(ServiceError::Cancelled("task cancelled before launch".into()));
        }
        counter!(TASKS_TOTAL, "status" => "running").increment(1);

        // The credential bundle exists only while this attempt runs.
        let bundle = match self.resolve_credentials(&task)? {
            Some((username, password)) => Some(
                self.launcher
                    .create_cred_bundle(task_id, &username, &password)
                    .await
                    .map_err(|e| {
                        ServiceError::Unavailable(format!(
                            "failed to create credential bundle: {e}"
                        ))
                    })?,
            ),
            None => None,
        };

        let result = self
            .launch_and_track(cancel, &task, bundle.as_deref(), &nodes)
            .await;

        if let Some(name) = bundle {
            if let Err(e) = self.launcher.delete_cred_bundle(&name).await {
                warn!(task_id, bundle = %name, error = %e, "failed to delete credential bundle");
            }
        }

        result?;
        Ok(self.store.get(task_id)?.status)
    }

    async fn launch_and_track(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        cred_secret: Option<&str>,
        nodes: &[String],
    ) -> Result<(), ServiceError> {
        self.batches
            .execute_batches(
                cancel,
                &task.id,
                nodes,
                &task.images,
                cred_secret,
                task.batch_size,
                |batch_num, _succeeded, _failed| {
                    if let Ok(mut current) = self.store.get(&task.id) {
                        if let Some(progress) = &mut current.progress {
                            progress.current_batch = batch_num;
                        }
                        if let Err(e) = self.store.update(&current) {
                            warn!(task_id = %task.id, error = %e, "failed to record batch progress");
                        }
                    }
                },
            )
            .await?;

        self.tracker.track_task(cancel, &task.id).await
    }

    /// Decide between retry and terminal failure. Never overwrites a
    /// cancellation.
    async fn handle_failure(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
        reason: &str,
    ) -> FailureDisposition {
        if cancel.is_cancelled() {
            info!(task_id, "task context cancelled, skipping failure handling");
            return FailureDisposition::Abandon;
        }

        let mut task = match self.store.get(task_id) {
            Ok(task) => task,
            Err(_) => return FailureDisposition::Abandon,
        };
        if task.status == TaskStatus::Cancelled {
            return FailureDisposition::Abandon;
        }

        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            let strategy = RetryStrategy::from_name(&task.retry_strategy);
            let delay = strategy.delay(task.retry_count, task.retry_delay);

            info!(
                task_id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                delay_secs = delay.as_secs(),
                error = reason,
                "task failed, scheduling retry"
            );

            task.status = TaskStatus::Pending;
            task.finished_at = None;
            task.error_message = reason.to_string();
            match self.store.update_if_not_cancelled(&task) {
                Ok(true) => {}
                Ok(false) => return FailureDisposition::Abandon,
                Err(e) => {
                    error!(task_id, error = %e, "failed to update task for retry");
                    return FailureDisposition::Abandon;
                }
            }

            // Clear the previous attempt's workers so names can be reused.
            if let Ok(workers) = self.launcher.list_workers(task_id).await {
                for worker in workers {
                    if let Err(e) = self.launcher.delete_worker(&worker.name).await {
                        warn!(task_id, worker = %worker.name, error = %e, "failed to delete stale worker");
                    }
                }
            }

            return FailureDisposition::Retry(delay);
        }

        error!(
            task_id,
            retry_count = task.retry_count,
            error = reason,
            "task failed after max retries"
        );

        if !task.status.is_terminal() {
            task.status = TaskStatus::Failed;
            task.finished_at = Some(now_rfc3339());
            counter!(TASKS_TOTAL, "status" => "failed").increment(1);
        }
        task.error_message = reason.to_string();
        if let Err(e) = self.store.update(&task) {
            error!(task_id, error = %e, "failed to update task status to failed");
        }

        if let Err(e) = self.webhooks.notify_task_failed(&task) {
            warn!(task_id, error = %e, "failed to send webhook notification for failed task");
        }

        FailureDisposition::Terminal
    }

    /// Terminal-side bookkeeping shared by the completed and failed exits.
    fn finish_terminal(&self, task_id: &str, status: TaskStatus, started: Instant) {
        histogram!(TASK_DURATION, "status" => status.as_str())
            .record(started.elapsed().as_secs_f64());
        gauge!(ACTIVE_TASKS).decrement(1.0);

        if status == TaskStatus::Completed {
            if let Ok(task) = self.store.get(task_id) {
                if let Err(e) = self.webhooks.notify_task_completed(&task) {
                    warn!(task_id, error = %e, "failed to send webhook notification for completed task");
                }
            }
        }
    }

    /// Crash-recovery sweep: delete credential bundles whose task no
    /// longer exists or is already terminal. Run once at startup.
    pub async fn purge_stale_bundles(&self) -> Result<usize, ServiceError> {
        let bundles = self
            .launcher
            .list_cred_bundles()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to list bundles: {e}")))?;

        let mut purged = 0;
        for (name, task_id) in bundles {
            let stale = match self.store.get(&task_id) {
                Ok(task) => task.status.is_terminal(),
                Err(ServiceError::NotFound(_)) => true,
                Err(_) => false,
            };
            if stale {
                match self.launcher.delete_cred_bundle(&name).await {
                    Ok(()) => {
                        info!(bundle = %name, task_id = %task_id, "purged stale credential bundle");
                        purged += 1;
                    }
                    Err(e) => warn!(bundle = %name, error = %e, "failed to purge stale bundle"),
                }
            }
        }
        Ok(purged)
    }

    fn resolve_credentials(&self, task: &Task) -> Result<Option<(String, String)>, ServiceError> {
        if let Some(auth) = &task.registry_auth {
            return Ok(Some((auth.username.clone(), auth.password.clone())));
        }
        if let Some(secret_id) = task.secret_id {
            let secret = self.secrets.get(secret_id)?;
            return Ok(Some((secret.username, secret.password)));
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Read / delete
    // -----------------------------------------------------------------------

    pub fn get_task(&self, id: &str) -> Result<Task, ServiceError> {
        self.store.get(id)
    }

    /// Newest-first listing. Returns `(page, limit, offset)` after clamping.
    pub fn list_tasks(
        &self,
        offset: Option<i64>,
        limit: Option<i64>,
    ) -> Result<(ListResult<Task>, i64, i64), ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(0, MAX_LIST_LIMIT);
        let offset = offset.unwrap_or(0).max(0);
        let page = self.store.list(offset, limit)?;
        Ok((page, limit, offset))
    }

    /// Delete a terminal task's record, or cancel a non-terminal task.
    /// Returns the action taken: `"deleted"` or `"cancelled"`.
    pub async fn delete_task(&self, id: &str) -> Result<&'static str, ServiceError> {
        let mut task = self.store.get(id)?;

        if task.status.is_terminal() {
            self.store.delete(id)?;
            info!(task_id = id, "task record deleted");
            return Ok("deleted");
        }

        // Collapse the task's whole cancellation subtree: slot wait,
        // in-flight worker creation, tracker, retry sleep.
        if let Some(token) = self.cancellations.lock().await.get(id) {
            token.cancel();
        }

        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now_rfc3339());
        self.store.update(&task)?;

        counter!(TASKS_TOTAL, "status" => "cancelled").increment(1);
        gauge!(ACTIVE_TASKS).decrement(1.0);
        if let Some(started_at) = &task.started_at {
            if let Ok(started) = chrono::DateTime::parse_from_rfc3339(started_at) {
                let elapsed = chrono::Utc::now().signed_duration_since(started);
                histogram!(TASK_DURATION, "status" => "cancelled")
                    .record(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
            }
        }

        if let Err(e) = self.webhooks.notify_task_cancelled(&task) {
            warn!(task_id = id, error = %e, "failed to send webhook notification for cancelled task");
        }

        info!(task_id = id, "task cancelled");
        Ok("cancelled")
    }
}

fn validate_request(req: &CreateTaskRequest) -> Result<(), ServiceError> {
    if req.images.is_empty() {
        return Err(ServiceError::Validation(
            "at least one image is required".into(),
        ));
    }
    if req.images.len() > MAX_IMAGES_PER_TASK {
        return Err(ServiceError::Validation(
            "too many images: max 50 images allowed per task".into(),
        ));
    }
    if !(1..=100).contains(&req.batch_size) {
        return Err(ServiceError::Validation(
            "batch size must be between 1 and 100".into(),
        ));
    }
    if let Some(priority) = req.priority {
        if !(1..=10).contains(&priority) {
            return Err(ServiceError::Validation(
                "priority must be between 1 and 10".into(),
            ));
        }
    }
    if let Some(max_retries) = req.max_retries {
        if !(0..=5).contains(&max_retries) {
            return Err(ServiceError::Validation(
                "max retries must be between 0 and 5".into(),
            ));
        }
    }
    if let Some(retry_delay) = req.retry_delay {
        if !(1..=300).contains(&retry_delay) {
            return Err(ServiceError::Validation(
                "retry delay must be between 1 and 300 seconds".into(),
            ));
        }
    }
    if let Some(strategy) = &req.retry_strategy {
        if !strategy.is_empty() && strategy != "linear" && strategy != "exponential" {
            return Err(ServiceError::Validation(format!(
                "unknown retry strategy: {strategy}"
            )));
        }
    }
    if let Some(url) = &req.webhook_url {
        if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ServiceError::Validation(
                "webhook url must be http or https".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prewarm_cluster::{LauncherConfig, MemoryCluster};
    use prewarm_sql::SqliteStore;

    struct Fixture {
        manager: Arc<TaskManager>,
        cluster: Arc<MemoryCluster>,
        store: Arc<TaskStore>,
        shutdown: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn fixture(max_concurrency: usize, node_count: usize) -> Fixture {
        fixture_inner(max_concurrency, node_count, true)
    }

    /// Fixture whose dispatcher is not running: admitted tasks stay
    /// pending, so admission-level assertions are deterministic.
    fn idle_fixture(max_concurrency: usize, node_count: usize) -> Fixture {
        fixture_inner(max_concurrency, node_count, false)
    }

    fn fixture_inner(max_concurrency: usize, node_count: usize, dispatch: bool) -> Fixture {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Arc::new(TaskStore::new(db.clone()).unwrap());
        let secrets = Arc::new(SecretStore::new(db).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        for i in 0..node_count {
            cluster.add_node(&format!("node-{i}"));
        }
        let launcher = Arc::new(WorkerLauncher::new(
            cluster.clone(),
            LauncherConfig {
                puller_image: "crictl:test".into(),
                cri_socket_path: "/run/containerd/containerd.sock".into(),
            },
        ));
        let manager = TaskManager::with_tracker_config(
            store.clone(),
            secrets,
            launcher,
            cluster.clone(),
            max_concurrency,
            TrackerConfig {
                liveness_interval: Duration::from_millis(50),
                poll_interval: Duration::from_millis(50),
            },
        );
        let shutdown = CancellationToken::new();
        if dispatch {
            manager.start(shutdown.clone());
        }
        Fixture {
            manager,
            cluster,
            store,
            shutdown,
        }
    }

    fn request(images: Vec<&str>, batch_size: i64) -> CreateTaskRequest {
        CreateTaskRequest {
            images: images.into_iter().map(String::from).collect(),
            batch_size,
            ..Default::default()
        }
    }

    async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !condition() {
            if Instant::now() > deadline {
                panic!("condition not met within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn admission_rejects_bad_requests() {
        let f = idle_fixture(3, 1);

        let err = f.manager.create_task(request(vec![], 2)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let too_many: Vec<String> = (0..51).map(|i| format!("img-{i}:latest")).collect();
        let req = CreateTaskRequest {
            images: too_many,
            batch_size: 2,
            ..Default::default()
        };
        assert!(f.manager.create_task(req).await.is_err());

        let mut req = request(vec!["nginx:1"], 0);
        assert!(f.manager.create_task(req.clone()).await.is_err());
        req.batch_size = 101;
        assert!(f.manager.create_task(req).await.is_err());

        let mut req = request(vec!["nginx:1"], 2);
        req.priority = Some(11);
        assert!(f.manager.create_task(req).await.is_err());

        let mut req = request(vec!["nginx:1"], 2);
        req.retry_strategy = Some("fibonacci".into());
        assert!(f.manager.create_task(req).await.is_err());

        let mut req = request(vec!["nginx:1"], 2);
        req.webhook_url = Some("ftp://example.com".into());
        assert!(f.manager.create_task(req).await.is_err());
    }

    #[tokio::test]
    async fn admission_applies_defaults() {
        let f = idle_fixture(3, 1);
        let task = f.manager.create_task(request(vec!["nginx:1"], 2)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert_eq!(task.retry_strategy, "linear");
        assert_eq!(task.retry_delay, 30);
        assert_eq!(task.max_retries, 0);
        assert_eq!(task.retry_count, 0);
        assert!(task.id.starts_with("task-"));

        // Create-then-get round trip.
        let got = f.manager.get_task(&task.id).unwrap();
        assert_eq!(
            serde_json::to_value(&got).unwrap(),
            serde_json::to_value(&task).unwrap()
        );
    }

    #[tokio::test]
    async fn happy_path_completes_across_batches() {
        let f = fixture(3, 5);
        let task = f.manager.create_task(request(vec!["nginx:1"], 2)).await.unwrap();

        // 5 nodes at batch size 2: 3 batches, 5 workers.
        let cluster = f.cluster.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&id).len() == 5
        })
        .await;
        f.cluster.complete_all(&task.id, r#"{"nginx:1":1}"#);

        let store = f.store.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            store.get(&id).map(|t| t.status.is_terminal()).unwrap_or(false)
        })
        .await;

        let done = f.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());

        let progress = done.progress.unwrap();
        assert_eq!(progress.total_nodes, 5);
        assert_eq!(progress.total_batches, 3);
        assert_eq!(progress.completed_nodes, 5);
        assert_eq!(progress.failed_nodes, 0);
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(done.node_statuses.len(), 5);
    }

    #[tokio::test]
    async fn no_eligible_nodes_fails_the_task() {
        let f = fixture(3, 0);
        let task = f.manager.create_task(request(vec!["nginx:1"], 2)).await.unwrap();

        let store = f.store.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            store.get(&id).map(|t| t.status == TaskStatus::Failed).unwrap_or(false)
        })
        .await;

        let failed = f.store.get(&task.id).unwrap();
        assert!(failed.error_message.contains("no ready nodes"));
    }

    #[tokio::test]
    async fn retry_reruns_until_success() {
        let f = fixture(3, 1);
        let mut req = request(vec!["nginx:1"], 1);
        req.max_retries = Some(1);
        req.retry_delay = Some(1);
        let task = f.manager.create_task(req).await.unwrap();

        // First attempt: the single worker fails, putting the run below
        // the success threshold.
        let cluster = f.cluster.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&id).len() == 1
        })
        .await;
        let worker = f.cluster.worker_names(&task.id)[0].clone();
        f.cluster.fail_worker(&worker, "disk full");

        // The retry deletes the stale worker and creates a fresh one.
        let store = f.store.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(10), || {
            store.get(&id).map(|t| t.retry_count == 1).unwrap_or(false)
        })
        .await;
        let cluster = f.cluster.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(10), || {
            let names = cluster.worker_names(&id);
            names.len() == 1
        })
        .await;
        // Second attempt succeeds.
        wait_until(Duration::from_secs(10), || {
            let names = cluster.worker_names(&task.id);
            if names.is_empty() {
                return false;
            }
            cluster.complete_worker(&names[0], r#"{"nginx:1":1}"#);
            store
                .get(&task.id)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
        .await;

        let done = f.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retry_count, 1);
        assert!(done.retry_count <= done.max_retries);
    }

    #[tokio::test]
    async fn exhausted_retries_end_failed() {
        let f = fixture(3, 0); // no nodes: every attempt fails fast
        let mut req = request(vec!["nginx:1"], 1);
        req.max_retries = Some(2);
        req.retry_delay = Some(1);
        let task = f.manager.create_task(req).await.unwrap();

        let store = f.store.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(10), || {
            store.get(&id).map(|t| t.status == TaskStatus::Failed).unwrap_or(false)
        })
        .await;

        let failed = f.store.get(&task.id).unwrap();
        assert_eq!(failed.retry_count, 2);
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_slot_never_runs() {
        let f = fixture(1, 1);

        // First task occupies the only slot; its worker never finishes.
        let first = f.manager.create_task(request(vec!["nginx:1"], 1)).await.unwrap();
        let cluster = f.cluster.clone();
        let first_id = first.id.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&first_id).len() == 1
        })
        .await;

        // Second task queues behind the semaphore.
        let second = f.manager.create_task(request(vec!["nginx:1"], 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.store.get(&second.id).unwrap().status,
            TaskStatus::Pending
        );

        let action = f.manager.delete_task(&second.id).await.unwrap();
        assert_eq!(action, "cancelled");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancelled = f.store.get(&second.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
        // It never transitioned to running and created no workers.
        assert!(cancelled.started_at.is_none());
        assert!(f.cluster.worker_names(&second.id).is_empty());

        // Deleting the now-terminal task removes the record.
        let action = f.manager.delete_task(&second.id).await.unwrap();
        assert_eq!(action, "deleted");
        assert!(f.manager.get_task(&second.id).is_err());
    }

    #[tokio::test]
    async fn cancel_running_task_aborts_tracking() {
        let f = fixture(3, 1);
        let task = f.manager.create_task(request(vec!["nginx:1"], 1)).await.unwrap();

        let cluster = f.cluster.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&id).len() == 1
        })
        .await;

        let action = f.manager.delete_task(&task.id).await.unwrap();
        assert_eq!(action, "cancelled");

        // The record stays cancelled: the tracker must not resurrect it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            f.store.get(&task.id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn concurrency_cap_holds() {
        let f = fixture(2, 1);

        for _ in 0..4 {
            f.manager.create_task(request(vec!["nginx:1"], 1)).await.unwrap();
        }

        let store = f.store.clone();
        wait_until(Duration::from_secs(5), || {
            store.count_status(TaskStatus::Running).unwrap() == 2
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Never more than the cap past the running transition.
        assert_eq!(f.store.count_status(TaskStatus::Running).unwrap(), 2);
        assert_eq!(f.store.count_status(TaskStatus::Pending).unwrap(), 2);
    }

    #[tokio::test]
    async fn list_is_paginated_and_clamped() {
        let f = idle_fixture(1, 0);
        for _ in 0..3 {
            f.manager.create_task(request(vec!["nginx:1"], 1)).await.unwrap();
        }

        let (page, limit, offset) = f.manager.list_tasks(None, None).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(limit, 20);
        assert_eq!(offset, 0);

        let (_, limit, _) = f.manager.list_tasks(Some(0), Some(500)).unwrap();
        assert_eq!(limit, 100);

        let (page, _, offset) = f.manager.list_tasks(Some(2), Some(2)).unwrap();
        assert_eq!(offset, 2);
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn stale_bundle_sweep_keeps_live_tasks() {
        let f = idle_fixture(1, 1);

        // A live task's bundle must survive; an orphan must not.
        let live = f.manager.create_task(request(vec!["nginx:1"], 1)).await.unwrap();
        f.cluster
            .create_secret(&format!("registry-creds-{}", live.id), &live.id, "a:b")
            .await
            .unwrap();
        f.cluster
            .create_secret("registry-creds-task-gone", "task-gone", "c:d")
            .await
            .unwrap();

        let purged = f.manager.purge_stale_bundles().await.unwrap();
        assert_eq!(purged, 1);
        assert!(f
            .cluster
            .secret_value(&format!("registry-creds-{}", live.id))
            .is_some());
        assert!(f.cluster.secret_value("registry-creds-task-gone").is_none());
    }

    #[tokio::test]
    async fn delete_missing_task_is_not_found() {
        let f = idle_fixture(1, 0);
        let err = f
            .manager
            .delete_task("task-00000000-000000-00000000")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn inline_credentials_create_and_remove_bundle() {
        let f = fixture(3, 1);
        let mut req = request(vec!["private.example.com/app:1"], 1);
        req.registry_auth = Some(crate::model::RegistryAuth {
            registry: "private.example.com".into(),
            username: "bot".into(),
            password: "hunter2".into(),
        });
        let task = f.manager.create_task(req).await.unwrap();

        let cluster = f.cluster.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&id).len() == 1
        })
        .await;

        // Bundle exists while the attempt is in flight.
        let bundle = format!("registry-creds-{}", task.id);
        assert_eq!(
            f.cluster.secret_value(&bundle).as_deref(),
            Some("bot:hunter2")
        );

        f.cluster
            .complete_all(&task.id, r#"{"private.example.com/app:1":1}"#);
        let store = f.store.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            store.get(&id).map(|t| t.status.is_terminal()).unwrap_or(false)
        })
        .await;

        // Deleted on task termination.
        let cluster = f.cluster.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.secret_value(&bundle).is_none()
        })
        .await;
    }
}
