use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a pre-warm task.
///
/// ```text
/// pending → running → completed
///                   → failed (→ pending, while retries remain)
///         → cancelled (from any non-terminal state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Terminal verdict: a run counts as completed when at least this share of
/// nodes pulled successfully.
pub const SUCCESS_RATE_THRESHOLD: f64 = 0.9;

/// Per-batch node progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_nodes: i64,
    pub completed_nodes: i64,
    pub failed_nodes: i64,
    pub current_batch: i64,
    pub total_batches: i64,
    pub percentage: f64,
}

/// Details recorded for a node whose worker failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedNode {
    pub node_name: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub timestamp: String,
}

/// Inline registry authentication supplied with a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// An image pre-warm task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "taskId")]
    pub id: String,
    pub status: TaskStatus,
    /// 1–10, higher wins at dispatch time.
    pub priority: i64,
    pub images: Vec<String>,
    pub batch_size: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(
        rename = "failedNodeDetails",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub failed_nodes: Vec<FailedNode>,
    pub max_retries: i64,
    pub retry_count: i64,
    pub retry_strategy: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_delay: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub webhook_url: String,
    /// Reference to a stored registry credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<i64>,
    /// Inline registry credential (alternative to `secret_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<RegistryAuth>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    /// nodeName -> imageName -> pull outcome (1 success, 0 failure).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_statuses: BTreeMap<String, BTreeMap<String, i64>>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl Task {
    /// Recompute the completion percentage from the progress counters.
    pub fn calculate_progress(&mut self) {
        if let Some(progress) = &mut self.progress {
            if progress.total_nodes == 0 {
                progress.percentage = 0.0;
            } else {
                progress.percentage =
                    progress.completed_nodes as f64 / progress.total_nodes as f64 * 100.0;
            }
        }
    }
}

/// Generate a task id: `task-YYYYMMDD-HHMMSS-<8 hex>`.
pub fn generate_task_id() -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{timestamp}-{}", &hex[..8])
}

// ---------------------------------------------------------------------------
// API request / response types
// ---------------------------------------------------------------------------

/// Body for `POST /tasks` — also embedded verbatim in scheduled tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub images: Vec<String>,
    pub batch_size: i64,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub retry_strategy: Option<String>,
    #[serde(default)]
    pub retry_delay: Option<i64>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub secret_id: Option<i64>,
    #[serde(default)]
    pub registry_auth: Option<RegistryAuth>,
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Minimal valid task for tests across the crate.
#[cfg(test)]
pub(crate) fn sample_task() -> Task {
    Task {
        id: generate_task_id(),
        status: TaskStatus::Pending,
        priority: 5,
        images: vec!["nginx:1".into()],
        batch_size: 2,
        node_selector: BTreeMap::new(),
        progress: None,
        failed_nodes: Vec::new(),
        max_retries: 0,
        retry_count: 0,
        retry_strategy: "linear".into(),
        retry_delay: 30,
        webhook_url: String::new(),
        secret_id: None,
        registry_auth: None,
        created_at: prewarm_core::now_rfc3339(),
        started_at: None,
        finished_at: None,
        error_message: String::new(),
        node_statuses: BTreeMap::new(),
    }
}
