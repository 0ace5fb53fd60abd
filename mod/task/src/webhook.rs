use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use prewarm_core::{now_rfc3339, ServiceError};

use crate::model::Task;

pub const EVENT_TASK_COMPLETED: &str = "task.completed";
pub const EVENT_TASK_FAILED: &str = "task.failed";
pub const EVENT_TASK_CANCELLED: &str = "task.cancelled";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const USER_AGENT: &str = concat!("prewarm-webhook/", env!("CARGO_PKG_VERSION"));

/// Body POSTed to the task's webhook URL on terminal transitions.
#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub event: String,
    pub task: Task,
    pub timestamp: String,
    pub message: String,
}

/// Delivers terminal-state notifications, at-least-once with bounded
/// retries. Delivery never blocks task-state persistence: the HTTP send
/// runs in a detached task.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("webhook http client"),
        }
    }

    /// Queue a notification for the task, if it has a webhook URL.
    /// Serialisation failure is terminal and reported to the caller.
    pub fn notify(&self, task: &Task, event: &str, message: &str) -> Result<(), ServiceError> {
        if task.webhook_url.is_empty() {
            return Ok(());
        }

        let payload = WebhookPayload {
            event: event.to_string(),
            task: task.clone(),
            timestamp: now_rfc3339(),
            message: message.to_string(),
        };
        let body = serde_json::to_vec(&payload).map_err(|e| {
            ServiceError::Internal(format!("failed to serialise webhook payload: {e}"))
        })?;

        let client = self.client.clone();
        let url = task.webhook_url.clone();
        tokio::spawn(send_with_retry(client, url, body));

        Ok(())
    }

    pub fn notify_task_completed(&self, task: &Task) -> Result<(), ServiceError> {
        self.notify(task, EVENT_TASK_COMPLETED, "Task completed successfully")
    }

    pub fn notify_task_failed(&self, task: &Task) -> Result<(), ServiceError> {
        self.notify(task, EVENT_TASK_FAILED, "Task failed after all retries")
    }

    pub fn notify_task_cancelled(&self, task: &Task) -> Result<(), ServiceError> {
        self.notify(task, EVENT_TASK_CANCELLED, "Task was cancelled")
    }
}

/// Attempt `n` waits `n * 2s` before attempt `n + 1`.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs((attempt as u64) * 2)
}

async fn send_with_retry(client: reqwest::Client, url: String, body: Vec<u8>) {
    for attempt in 1..=MAX_ATTEMPTS {
        match send(&client, &url, body.clone()).await {
            Ok(()) => {
                info!(url = %url, attempt, "webhook notification sent");
                return;
            }
            Err(e) => {
                warn!(url = %url, attempt, error = %e, "failed to send webhook notification");
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
            }
        }
    }
    error!(url = %url, attempts = MAX_ATTEMPTS, "webhook notification failed after all retries");
}

async fn send(client: &reqwest::Client, url: &str, body: Vec<u8>) -> Result<(), String> {
    let resp = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .body(body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = resp.status();
    if !status.is_success() {
        return Err(format!("unexpected status code: {status}"));
    }
    Ok(())
}
