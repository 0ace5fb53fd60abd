//! Metric name constants shared across modules.
//!
//! Names follow the Prometheus convention (`*_total` for counters). The
//! binary installs the Prometheus recorder; modules record through the
//! `metrics` facade using these constants.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Tasks created / transitioned, labelled by status.
pub const TASKS_TOTAL: &str = "prewarm_tasks_total";

/// Task duration in seconds, labelled by terminal status.
pub const TASK_DURATION: &str = "prewarm_task_duration_seconds";

/// Currently active (non-terminal) tasks.
pub const ACTIVE_TASKS: &str = "prewarm_active_tasks";

/// Nodes processed, labelled success/failed.
pub const NODES_PROCESSED: &str = "prewarm_nodes_processed_total";

/// Worker creations, labelled success/failed.
pub const WORKER_CREATION_TOTAL: &str = "prewarm_worker_creation_total";

/// Per-(node, image) pull outcomes, labelled node/image/status.
pub const IMAGE_PREWARM_STATUS: &str = "prewarm_image_status_total";

/// Scheduled-task executions, labelled by outcome.
pub const SCHEDULED_EXECUTIONS_TOTAL: &str = "prewarm_scheduled_executions_total";

/// Scheduled tasks currently registered with the cron engine.
pub const ACTIVE_SCHEDULED_TASKS: &str = "prewarm_active_scheduled_tasks";

/// Register descriptions for all metrics. Call once at startup, after the
/// recorder is installed.
pub fn describe_metrics() {
    describe_counter!(TASKS_TOTAL, "Total number of image prewarming tasks by status");
    describe_histogram!(TASK_DURATION, "Duration of image prewarming tasks in seconds");
    describe_gauge!(ACTIVE_TASKS, "Current number of active image prewarming tasks");
    describe_counter!(NODES_PROCESSED, "Total number of nodes processed for image prewarming");
    describe_counter!(WORKER_CREATION_TOTAL, "Total number of workers created");
    describe_counter!(IMAGE_PREWARM_STATUS, "Per node and image pull outcomes");
    describe_counter!(
        SCHEDULED_EXECUTIONS_TOTAL,
        "Total number of scheduled task executions by outcome"
    );
    describe_gauge!(
        ACTIVE_SCHEDULED_TASKS,
        "Number of scheduled tasks registered with the cron engine"
    );
}
