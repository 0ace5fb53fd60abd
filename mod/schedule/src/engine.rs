use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use prewarm_core::metrics::{ACTIVE_SCHEDULED_TASKS, SCHEDULED_EXECUTIONS_TOTAL};
use prewarm_core::{new_id, now_rfc3339, ListResult, ServiceError};
use prewarm_task::{TaskManager, TaskStatus};

use crate::model::{
    CreateScheduledTaskRequest, ExecutionStatus, OverlapPolicy, ScheduledExecution, ScheduledTask,
    UpdateScheduledTaskRequest,
};
use crate::store::ScheduleStore;

/// Execution history is kept for 90 days.
const RETENTION_DAYS: i64 = 90;

/// Engine timing knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cron due-check cadence.
    pub tick_interval: Duration,
    /// Child-task poll cadence inside the monitor.
    pub monitor_poll: Duration,
    /// History cleanup cadence.
    pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            monitor_poll: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(24 * 3600),
        }
    }
}

struct Entry {
    schedule: Schedule,
    next: DateTime<Utc>,
}

#[derive(Default)]
struct EngineState {
    entries: HashMap<String, Entry>,
    /// Scheduled tasks with a fire currently in flight.
    executing: HashSet<String>,
    /// Queue tokens per scheduled task (overlap policy `queue`). In-memory
    /// only: tokens do not survive a restart.
    queued: HashMap<String, Vec<String>>,
}

/// Cron engine: holds an entry per enabled scheduled task, fires due
/// entries, applies the overlap policy, and records execution history.
pub struct ScheduleEngine {
    store: Arc<ScheduleStore>,
    tasks: Arc<TaskManager>,
    state: Mutex<EngineState>,
    config: EngineConfig,
}

/// Normalise a cron expression for the parser: map the predefined
/// descriptors to their 5-field forms, then prepend the seconds field the
/// `cron` crate expects.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    let mapped = match trimmed {
        "@hourly" => "0 * * * *",
        "@daily" | "@midnight" => "0 0 * * *",
        "@weekly" => "0 0 * * SUN",
        "@monthly" => "0 0 1 * *",
        "@yearly" | "@annually" => "0 0 1 1 *",
        other => other,
    };
    if mapped.split_whitespace().count() == 5 {
        format!("0 {mapped}")
    } else {
        mapped.to_string()
    }
}

fn parse_cron(expr: &str) -> Result<Schedule, ServiceError> {
    Schedule::from_str(&normalize_cron(expr))
        .map_err(|e| ServiceError::Validation(format!("invalid cron expression {expr:?}: {e}")))
}

fn seconds_since(start_rfc3339: &str) -> f64 {
    chrono::DateTime::parse_from_rfc3339(start_rfc3339)
        .map(|start| {
            let elapsed = Utc::now().signed_duration_since(start.with_timezone(&Utc));
            elapsed.num_milliseconds().max(0) as f64 / 1000.0
        })
        .unwrap_or(0.0)
}

impl ScheduleEngine {
    pub fn new(store: Arc<ScheduleStore>, tasks: Arc<TaskManager>) -> Arc<Self> {
        Self::with_config(store, tasks, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<ScheduleStore>,
        tasks: Arc<TaskManager>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tasks,
            state: Mutex::new(EngineState::default()),
            config,
        })
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    /// Load all enabled scheduled tasks and begin ticking.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let enabled = self.store.list_enabled()?;
        let loaded = enabled.len();
        for task in enabled {
            if let Err(e) = self.insert_entry(&task) {
                error!(
                    scheduled_task_id = %task.id,
                    cron = %task.cron_expr,
                    error = %e,
                    "failed to schedule task at startup"
                );
            }
        }
        info!(tasks_loaded = loaded, "scheduled task engine started");

        // Tick loop.
        {
            let engine = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("scheduled task engine stopped");
                            break;
                        }
                        _ = tokio::time::sleep(engine.config.tick_interval) => {
                            engine.tick().await;
                        }
                    }
                }
            });
        }

        // History cleanup loop.
        {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(engine.config.cleanup_interval) => {
                            match engine.cleanup_old_executions() {
                                Ok(0) => {}
                                Ok(n) => info!(deleted = n, "cleaned up old scheduled executions"),
                                Err(e) => error!(error = %e, "execution history cleanup failed"),
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Fire every entry whose next fire time has passed, advancing it.
    async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        let due: Vec<(String, Option<DateTime<Utc>>)> = {
            let mut state = self.state.lock().unwrap();
            let mut due = Vec::new();
            for (id, entry) in state.entries.iter_mut() {
                if entry.next <= now {
                    entry.next = entry
                        .schedule
                        .after(&now)
                        .next()
                        .unwrap_or(now + chrono::Duration::days(365 * 100));
                    due.push((id.clone(), Some(entry.next)));
                }
            }
            due
        };

        for (id, next) in due {
            if let Some(next) = next {
                if let Ok(mut task) = self.store.get(&id) {
                    task.next_execution_at = Some(next.to_rfc3339());
                    if let Err(e) = self.store.update(&task) {
                        warn!(scheduled_task_id = %id, error = %e, "failed to record next execution time");
                    }
                }
            }
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = engine.fire(&id).await {
                    warn!(scheduled_task_id = %id, error = %e, "scheduled fire failed");
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Entry management
    // -----------------------------------------------------------------------

    fn insert_entry(&self, task: &ScheduledTask) -> Result<(), ServiceError> {
        let schedule = parse_cron(&task.cron_expr)?;
        let next = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| ServiceError::Validation("cron expression never fires".into()))?;

        {
            let mut state = self.state.lock().unwrap();
            if state.entries.contains_key(&task.id) {
                return Err(ServiceError::Conflict(format!(
                    "scheduled task {} already scheduled",
                    task.id
                )));
            }
            state.entries.insert(task.id.clone(), Entry { schedule, next });
            gauge!(ACTIVE_SCHEDULED_TASKS).set(state.entries.len() as f64);
        }

        // Record the computed fire time; scheduling already succeeded.
        let mut task = task.clone();
        task.next_execution_at = Some(next.to_rfc3339());
        if let Err(e) = self.store.update(&task) {
            warn!(scheduled_task_id = %task.id, error = %e, "failed to record next execution time");
        }

        info!(
            scheduled_task_id = %task.id,
            cron = %task.cron_expr,
            next_execution = %next,
            "scheduled task added to engine"
        );
        Ok(())
    }

    fn drop_entry(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.entries.remove(id).is_some() {
            gauge!(ACTIVE_SCHEDULED_TASKS).set(state.entries.len() as f64);
            info!(scheduled_task_id = %id, "scheduled task removed from engine");
        }
    }

    /// Whether the engine currently holds an entry for the task.
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(id)
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub fn create_scheduled_task(
        &self,
        req: CreateScheduledTaskRequest,
        created_by: &str,
    ) -> Result<ScheduledTask, ServiceError> {
        if req.name.is_empty() {
            return Err(ServiceError::Validation("name is required".into()));
        }
        // Reject bad expressions at admission, before anything persists.
        parse_cron(&req.cron_expr)?;

        let now = now_rfc3339();
        let task = ScheduledTask {
            id: new_id(),
            name: req.name,
            description: req.description,
            cron_expr: req.cron_expr,
            enabled: req.enabled,
            task_config: req.task_config,
            overlap_policy: req.overlap_policy,
            timeout_seconds: req.timeout_seconds,
            last_execution_at: None,
            next_execution_at: None,
            created_by: created_by.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.create(&task)?;

        if task.enabled {
            self.insert_entry(&task)?;
        }
        Ok(self.store.get(&task.id)?)
    }

    pub fn get_scheduled_task(&self, id: &str) -> Result<ScheduledTask, ServiceError> {
        self.store.get(id)
    }

    pub fn list_scheduled_tasks(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<ListResult<ScheduledTask>, ServiceError> {
        self.store.list(offset, limit)
    }

    /// Update = remove the entry, persist the changes, re-add if enabled.
    pub fn update_scheduled_task(
        &self,
        id: &str,
        req: UpdateScheduledTaskRequest,
    ) -> Result<ScheduledTask, ServiceError> {
        let mut task = self.store.get(id)?;

        if let Some(cron_expr) = &req.cron_expr {
            parse_cron(cron_expr)?;
            task.cron_expr = cron_expr.clone();
        }
        if let Some(name) = req.name {
            task.name = name;
        }
        if let Some(description) = req.description {
            task.description = description;
        }
        if let Some(enabled) = req.enabled {
            task.enabled = enabled;
        }
        if let Some(task_config) = req.task_config {
            task.task_config = task_config;
        }
        if let Some(overlap_policy) = req.overlap_policy {
            task.overlap_policy = overlap_policy;
        }
        if let Some(timeout_seconds) = req.timeout_seconds {
            task.timeout_seconds = timeout_seconds;
        }
        task.updated_at = now_rfc3339();

        self.drop_entry(id);
        self.store.update(&task)?;
        if task.enabled {
            self.insert_entry(&task)?;
        }
        Ok(self.store.get(id)?)
    }

    pub fn delete_scheduled_task(&self, id: &str) -> Result<(), ServiceError> {
        self.drop_entry(id);
        self.store.delete(id)
    }

    pub fn enable_task(&self, id: &str) -> Result<(), ServiceError> {
        let mut task = self.store.get(id)?;
        task.enabled = true;
        task.updated_at = now_rfc3339();
        self.store.update(&task)?;

        // Idempotent: re-enabling replaces any existing entry.
        self.drop_entry(id);
        self.insert_entry(&task)
    }

    pub fn disable_task(&self, id: &str) -> Result<(), ServiceError> {
        let mut task = self.store.get(id)?;
        task.enabled = false;
        task.updated_at = now_rfc3339();
        self.store.update(&task)?;

        self.drop_entry(id);
        Ok(())
    }

    /// Manual fire. Errors when the fire was skipped or queued.
    pub async fn trigger_task(self: &Arc<Self>, id: &str) -> Result<String, ServiceError> {
        match self.fire(id).await? {
            Some(task_id) => Ok(task_id),
            None => Err(ServiceError::Conflict(
                "execution skipped: previous execution still running".into(),
            )),
        }
    }

    pub fn get_execution(&self, id: i64) -> Result<ScheduledExecution, ServiceError> {
        self.store.get_execution(id)
    }

    pub fn list_executions(
        &self,
        scheduled_task_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<ListResult<ScheduledExecution>, ServiceError> {
        self.store.list_executions(scheduled_task_id, offset, limit)
    }

    /// Delete execution history older than the retention window.
    pub fn cleanup_old_executions(&self) -> Result<u64, ServiceError> {
        let cutoff = (Utc::now() - chrono::Duration::days(RETENTION_DAYS)).to_rfc3339();
        self.store.delete_executions_before(&cutoff)
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// One fire of a scheduled task. Returns the child task id, or `None`
    /// when the overlap policy skipped or queued this fire.
    async fn fire(self: &Arc<Self>, id: &str) -> Result<Option<String>, ServiceError> {
        let mut task = self.store.get(id)?;
        if !task.enabled {
            return Err(ServiceError::Validation(format!(
                "scheduled task {id} is disabled"
            )));
        }

        let triggered_at = now_rfc3339();
        let mut execution = ScheduledExecution {
            id: 0,
            scheduled_task_id: id.to_string(),
            task_id: String::new(),
            status: ExecutionStatus::Success,
            triggered_at: triggered_at.clone(),
            started_at: triggered_at.clone(),
            finished_at: None,
            duration_seconds: 0.0,
            error_message: String::new(),
        };

        // Overlap policy. The in-memory executing flag covers the window
        // before the execution row lands in the store.
        if task.overlap_policy != OverlapPolicy::Allow {
            let busy = self.state.lock().unwrap().executing.contains(id)
                || !self.store.list_running_executions(id)?.is_empty();
            if busy {
                match task.overlap_policy {
                    OverlapPolicy::Skip => {
                        execution.status = ExecutionStatus::Skipped;
                        execution.error_message =
                            "previous execution still running, skipped".into();
                        execution.finished_at = Some(triggered_at);
                        if let Err(e) = self.store.create_execution(&mut execution) {
                            error!(scheduled_task_id = %id, error = %e, "failed to record skipped execution");
                        }
                        counter!(SCHEDULED_EXECUTIONS_TOTAL, "status" => "skipped").increment(1);
                        info!(scheduled_task_id = %id, "scheduled execution skipped (previous still running)");
                        return Ok(None);
                    }
                    OverlapPolicy::Queue => {
                        execution.status = ExecutionStatus::Skipped;
                        execution.error_message =
                            "previous execution still running, queued".into();
                        execution.finished_at = Some(triggered_at.clone());
                        if let Err(e) = self.store.create_execution(&mut execution) {
                            error!(scheduled_task_id = %id, error = %e, "failed to record queued execution");
                        }
                        {
                            let mut state = self.state.lock().unwrap();
                            state
                                .queued
                                .entry(id.to_string())
                                .or_default()
                                .push(format!("queued-{triggered_at}"));
                        }
                        counter!(SCHEDULED_EXECUTIONS_TOTAL, "status" => "queued").increment(1);
                        info!(scheduled_task_id = %id, "scheduled execution queued (previous still running)");
                        return Ok(None);
                    }
                    OverlapPolicy::Allow => unreachable!(),
                }
            }
        }

        self.state.lock().unwrap().executing.insert(id.to_string());

        let deadline = (task.timeout_seconds > 0)
            .then(|| Duration::from_secs(task.timeout_seconds as u64));

        let child = match self.tasks.create_task(task.task_config.clone()).await {
            Ok(child) => child,
            Err(e) => {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = format!("failed to create task: {e}");
                execution.finished_at = Some(now_rfc3339());
                execution.duration_seconds = seconds_since(&execution.started_at);
                if let Err(store_err) = self.store.create_execution(&mut execution) {
                    error!(scheduled_task_id = %id, error = %store_err, "failed to record failed execution");
                }
                counter!(SCHEDULED_EXECUTIONS_TOTAL, "status" => "failed").increment(1);

                self.finish_and_requeue(id);
                return Err(e);
            }
        };

        execution.task_id = child.id.clone();
        if let Err(e) = self.store.create_execution(&mut execution) {
            error!(scheduled_task_id = %id, error = %e, "failed to record execution");
        }

        task.last_execution_at = Some(triggered_at.clone());
        if let Err(e) = self.store.update(&task) {
            error!(scheduled_task_id = %id, error = %e, "failed to update last execution time");
        }

        info!(
            scheduled_task_id = %id,
            task_id = %child.id,
            triggered_at = %triggered_at,
            "scheduled task execution started"
        );

        let engine = Arc::clone(self);
        let scheduled_id = id.to_string();
        tokio::spawn(async move {
            engine.monitor(&scheduled_id, execution, deadline).await;
        });

        Ok(Some(child.id))
    }

    /// Wait for the child task to reach a terminal state (or the deadline),
    /// finalise the execution row, then release the executing flag and
    /// re-fire one queued token if present.
    async fn monitor(
        self: &Arc<Self>,
        scheduled_id: &str,
        mut execution: ScheduledExecution,
        deadline: Option<Duration>,
    ) {
        let deadline_at = tokio::time::Instant::now()
            + deadline.unwrap_or(Duration::from_secs(u32::MAX as u64));
        let has_deadline = deadline.is_some();
        let child_id = execution.task_id.clone();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline_at), if has_deadline => {
                    execution.status = ExecutionStatus::Timeout;
                    execution.error_message = "task execution timed out".into();
                    warn!(
                        scheduled_task_id = %scheduled_id,
                        task_id = %child_id,
                        "scheduled task execution timed out"
                    );
                    counter!(SCHEDULED_EXECUTIONS_TOTAL, "status" => "timeout").increment(1);

                    // Cancel the underlying task.
                    if let Err(e) = self.tasks.delete_task(&child_id).await {
                        warn!(task_id = %child_id, error = %e, "failed to cancel timed-out task");
                    }
                    break;
                }
                _ = tokio::time::sleep(self.config.monitor_poll) => {
                    match self.tasks.get_task(&child_id) {
                        Ok(child) if child.status.is_terminal() => {
                            execution.status = match child.status {
                                TaskStatus::Completed => ExecutionStatus::Success,
                                _ => ExecutionStatus::Failed,
                            };
                            if child.status == TaskStatus::Failed {
                                execution.error_message = child.error_message.clone();
                            } else if child.status == TaskStatus::Cancelled {
                                execution.error_message = "task was cancelled".into();
                            }
                            counter!(SCHEDULED_EXECUTIONS_TOTAL, "status" => execution.status.as_str())
                                .increment(1);
                            break;
                        }
                        Ok(_) => debug!(task_id = %child_id, "child task still running"),
                        Err(_) => {
                            // Record deleted out from under us.
                            execution.status = ExecutionStatus::Failed;
                            execution.error_message = "task record no longer exists".into();
                            counter!(SCHEDULED_EXECUTIONS_TOTAL, "status" => "failed").increment(1);
                            break;
                        }
                    }
                }
            }
        }

        execution.finished_at = Some(now_rfc3339());
        execution.duration_seconds = seconds_since(&execution.started_at);
        if let Err(e) = self.store.update_execution(&execution) {
            error!(
                scheduled_task_id = %scheduled_id,
                execution_id = execution.id,
                error = %e,
                "failed to finalise execution record"
            );
        }

        self.finish_and_requeue(scheduled_id);
    }

    /// Clear the executing flag and, if a queued token exists, pop one and
    /// fire again.
    fn finish_and_requeue(self: &Arc<Self>, scheduled_id: &str) {
        let refire = {
            let mut state = self.state.lock().unwrap();
            state.executing.remove(scheduled_id);
            match state.queued.get_mut(scheduled_id) {
                Some(queue) if !queue.is_empty() => {
                    queue.remove(0);
                    true
                }
                _ => false,
            }
        };

        if refire {
            info!(scheduled_task_id = %scheduled_id, "processing queued scheduled execution");
            let engine = Arc::clone(self);
            let id = scheduled_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = engine.fire(&id).await {
                    warn!(scheduled_task_id = %id, error = %e, "queued re-fire failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prewarm_cluster::{LauncherConfig, MemoryCluster, WorkerLauncher};
    use prewarm_registry::SecretStore;
    use prewarm_sql::SqliteStore;
    use prewarm_task::tracker::TrackerConfig;
    use prewarm_task::{CreateTaskRequest, TaskStore};

    struct Fixture {
        engine: Arc<ScheduleEngine>,
        cluster: Arc<MemoryCluster>,
        tasks: Arc<TaskManager>,
        shutdown: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn fixture() -> Fixture {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task_store = Arc::new(TaskStore::new(db.clone()).unwrap());
        let secrets = Arc::new(SecretStore::new(db.clone()).unwrap());
        let schedule_store = Arc::new(ScheduleStore::new(db).unwrap());

        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("node-0");
        let launcher = Arc::new(WorkerLauncher::new(
            cluster.clone(),
            LauncherConfig {
                puller_image: "crictl:test".into(),
                cri_socket_path: "/run/containerd/containerd.sock".into(),
            },
        ));
        let tasks = TaskManager::with_tracker_config(
            task_store,
            secrets,
            launcher,
            cluster.clone(),
            3,
            TrackerConfig {
                liveness_interval: Duration::from_millis(50),
                poll_interval: Duration::from_millis(50),
            },
        );
        let shutdown = CancellationToken::new();
        tasks.start(shutdown.clone());

        let engine = ScheduleEngine::with_config(
            schedule_store,
            tasks.clone(),
            EngineConfig {
                tick_interval: Duration::from_millis(50),
                monitor_poll: Duration::from_millis(50),
                cleanup_interval: Duration::from_secs(3600),
            },
        );
        engine.start(shutdown.clone()).unwrap();

        Fixture {
            engine,
            cluster,
            tasks,
            shutdown,
        }
    }

    fn create_request(cron: &str, policy: OverlapPolicy, timeout: i64) -> CreateScheduledTaskRequest {
        CreateScheduledTaskRequest {
            name: "nightly-prewarm".into(),
            description: String::new(),
            // Far-future fire time keeps the tick loop out of manual tests.
            cron_expr: cron.into(),
            enabled: true,
            task_config: CreateTaskRequest {
                images: vec!["nginx:1".into()],
                batch_size: 1,
                ..Default::default()
            },
            overlap_policy: policy,
            timeout_seconds: timeout,
        }
    }

    async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn normalize_maps_descriptors() {
        assert_eq!(normalize_cron("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron("@hourly"), "0 0 * * * *");
        assert_eq!(normalize_cron("@daily"), "0 0 0 * * *");
        assert_eq!(normalize_cron("@weekly"), "0 0 0 * * SUN");
        assert_eq!(normalize_cron("@monthly"), "0 0 0 1 * *");
        assert_eq!(normalize_cron("@yearly"), "0 0 0 1 1 *");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("@hourly").is_ok());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[tokio::test]
    async fn create_with_bad_cron_is_rejected() {
        let f = fixture();
        let err = f
            .engine
            .create_scheduled_task(
                create_request("banana", OverlapPolicy::Skip, 0),
                "admin",
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(f.engine.list_scheduled_tasks(0, 10).unwrap().total, 0);
    }

    #[tokio::test]
    async fn create_registers_entry_and_next_fire() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 0), "admin")
            .unwrap();
        assert!(f.engine.is_scheduled(&task.id));
        assert!(task.next_execution_at.is_some());
        assert_eq!(task.created_by, "admin");
    }

    #[tokio::test]
    async fn enable_disable_round_trips_entry_map() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 0), "admin")
            .unwrap();

        f.engine.disable_task(&task.id).unwrap();
        assert!(!f.engine.is_scheduled(&task.id));
        assert!(!f.engine.get_scheduled_task(&task.id).unwrap().enabled);

        f.engine.enable_task(&task.id).unwrap();
        assert!(f.engine.is_scheduled(&task.id));
        assert!(f.engine.get_scheduled_task(&task.id).unwrap().enabled);

        // Enable is idempotent: no duplicate-entry conflict.
        f.engine.enable_task(&task.id).unwrap();
        assert!(f.engine.is_scheduled(&task.id));
    }

    #[tokio::test]
    async fn trigger_creates_child_and_finalises_execution() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 0), "admin")
            .unwrap();

        let child_id = f.engine.trigger_task(&task.id).await.unwrap();
        assert!(child_id.starts_with("task-"));

        // Child's worker appears, then completes.
        let cluster = f.cluster.clone();
        let child = child_id.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&child).len() == 1
        })
        .await;
        f.cluster.complete_all(&child_id, r#"{"nginx:1":1}"#);

        let engine = f.engine.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(5), || {
            let page = engine.list_executions(&id, 0, 10).unwrap();
            page.items
                .first()
                .map(|e| e.status == ExecutionStatus::Success && e.finished_at.is_some())
                .unwrap_or(false)
        })
        .await;

        let executions = f.engine.list_executions(&task.id, 0, 10).unwrap();
        assert_eq!(executions.total, 1);
        assert_eq!(executions.items[0].task_id, child_id);
        assert!(executions.items[0].duration_seconds >= 0.0);

        let refreshed = f.engine.get_scheduled_task(&task.id).unwrap();
        assert!(refreshed.last_execution_at.is_some());
    }

    #[tokio::test]
    async fn skip_policy_never_overlaps() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 0), "admin")
            .unwrap();

        // First fire runs; its worker never completes.
        let first_child = f.engine.trigger_task(&task.id).await.unwrap();

        // Second fire is skipped while the first is live.
        let err = f.engine.trigger_task(&task.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let executions = f.engine.list_executions(&task.id, 0, 10).unwrap();
        assert_eq!(executions.total, 2);
        let skipped: Vec<_> = executions
            .items
            .iter()
            .filter(|e| e.status == ExecutionStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].task_id.is_empty());

        // Exactly one child task exists.
        let (tasks, _, _) = f.tasks.list_tasks(None, None).unwrap();
        assert_eq!(tasks.items.len(), 1);
        assert_eq!(tasks.items[0].id, first_child);
    }

    #[tokio::test]
    async fn queue_policy_refires_after_completion() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Queue, 0), "admin")
            .unwrap();

        let first_child = f.engine.trigger_task(&task.id).await.unwrap();
        // Queued while the first is live.
        assert!(f.engine.trigger_task(&task.id).await.is_err());

        // Finish the first child; the monitor should pop the token and
        // fire again.
        let cluster = f.cluster.clone();
        let child = first_child.clone();
        wait_until(Duration::from_secs(5), || {
            cluster.worker_names(&child).len() == 1
        })
        .await;
        f.cluster.complete_all(&first_child, r#"{"nginx:1":1}"#);

        let tasks = f.tasks.clone();
        wait_until(Duration::from_secs(10), || {
            tasks.list_tasks(None, None).unwrap().0.items.len() == 2
        })
        .await;

        let executions = f.engine.list_executions(&task.id, 0, 10).unwrap();
        // First run, the queued marker, and the re-fired run.
        assert_eq!(executions.total, 3);
    }

    #[tokio::test]
    async fn timeout_cancels_child_task() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 1), "admin")
            .unwrap();

        let child_id = f.engine.trigger_task(&task.id).await.unwrap();

        let engine = f.engine.clone();
        let id = task.id.clone();
        wait_until(Duration::from_secs(10), || {
            let page = engine.list_executions(&id, 0, 10).unwrap();
            page.items
                .first()
                .map(|e| e.status == ExecutionStatus::Timeout)
                .unwrap_or(false)
        })
        .await;

        let tasks = f.tasks.clone();
        wait_until(Duration::from_secs(5), || {
            tasks
                .get_task(&child_id)
                .map(|t| t.status == TaskStatus::Cancelled)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn disabled_task_does_not_fire() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 0), "admin")
            .unwrap();
        f.engine.disable_task(&task.id).unwrap();

        let err = f.engine.trigger_task(&task.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(f.engine.list_executions(&task.id, 0, 10).unwrap().total, 0);
    }

    #[tokio::test]
    async fn update_replaces_entry() {
        let f = fixture();
        let task = f
            .engine
            .create_scheduled_task(create_request("0 3 1 1 *", OverlapPolicy::Skip, 0), "admin")
            .unwrap();

        let updated = f
            .engine
            .update_scheduled_task(
                &task.id,
                UpdateScheduledTaskRequest {
                    cron_expr: Some("30 4 1 1 *".into()),
                    timeout_seconds: Some(120),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.cron_expr, "30 4 1 1 *");
        assert_eq!(updated.timeout_seconds, 120);
        assert!(f.engine.is_scheduled(&task.id));

        assert!(f
            .engine
            .update_scheduled_task(
                &task.id,
                UpdateScheduledTaskRequest {
                    cron_expr: Some("nope".into()),
                    ..Default::default()
                },
            )
            .is_err());
    }
}
