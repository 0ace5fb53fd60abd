use serde::{Deserialize, Serialize};

use prewarm_task::CreateTaskRequest;

/// What happens when a cron fire would overlap its predecessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Record a skipped execution and do nothing.
    #[default]
    Skip,
    /// Run regardless.
    Allow,
    /// Record a skipped execution now; re-fire once the running one ends.
    Queue,
}

/// Outcome of one scheduled execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// A cron-driven task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Standard 5-field cron expression, plus `@hourly`-style descriptors.
    pub cron_expr: String,
    pub enabled: bool,
    /// Template handed to task creation on each fire — same shape as the
    /// direct creation request.
    pub task_config: CreateTaskRequest,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    /// Per-execution deadline in seconds; 0 means unbounded.
    #[serde(default)]
    pub timeout_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution_at: Option<String>,
    #[serde(default)]
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledExecution {
    pub id: i64,
    pub scheduled_task_id: String,
    /// Child task id; empty when the fire was skipped before creation.
    #[serde(default)]
    pub task_id: String,
    pub status: ExecutionStatus,
    /// Planned fire time (actual start may lag when queued).
    pub triggered_at: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Body for `POST /scheduled-tasks`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduledTaskRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cron_expr: String,
    #[serde(default)]
    pub enabled: bool,
    pub task_config: CreateTaskRequest,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default)]
    pub timeout_seconds: i64,
}

/// Body for `PUT /scheduled-tasks/{id}`; omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduledTaskRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub task_config: Option<CreateTaskRequest>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

/// Query parameters for history and list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_policy_defaults_to_skip() {
        let json = r#"{
            "name": "nightly",
            "cronExpr": "0 3 * * *",
            "taskConfig": {"images": ["nginx:1"], "batchSize": 5}
        }"#;
        let req: CreateScheduledTaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.overlap_policy, OverlapPolicy::Skip);
        assert_eq!(req.timeout_seconds, 0);
        assert!(!req.enabled);
    }

    #[test]
    fn execution_status_roundtrip() {
        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::from_str(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            let back: ExecutionStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn scheduled_task_json_embeds_template() {
        let task = ScheduledTask {
            id: "st1".into(),
            name: "nightly".into(),
            description: String::new(),
            cron_expr: "0 3 * * *".into(),
            enabled: true,
            task_config: CreateTaskRequest {
                images: vec!["nginx:1".into()],
                batch_size: 5,
                ..Default::default()
            },
            overlap_policy: OverlapPolicy::Queue,
            timeout_seconds: 600,
            last_execution_at: None,
            next_execution_at: None,
            created_by: "admin".into(),
            created_at: prewarm_core::now_rfc3339(),
            updated_at: prewarm_core::now_rfc3339(),
        };

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"overlapPolicy\":\"queue\""));
        assert!(json.contains("\"taskConfig\""));

        let back: ScheduledTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_config.images, vec!["nginx:1"]);
        assert_eq!(back.overlap_policy, OverlapPolicy::Queue);
    }
}
