use std::sync::Arc;

use prewarm_core::{ListResult, ServiceError};
use prewarm_sql::{Row, SQLStore, Value};

use crate::model::{ExecutionStatus, ScheduledExecution, ScheduledTask};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id          TEXT PRIMARY KEY,
    data        TEXT NOT NULL,
    enabled     INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scheduled_executions (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    scheduled_task_id TEXT NOT NULL,
    task_id           TEXT NOT NULL DEFAULT '',
    status            TEXT NOT NULL,
    triggered_at      TEXT NOT NULL,
    started_at        TEXT NOT NULL,
    finished_at       TEXT,
    duration_seconds  REAL NOT NULL DEFAULT 0,
    error_message     TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_sched_exec_task ON scheduled_executions(scheduled_task_id);
CREATE INDEX IF NOT EXISTS idx_sched_exec_triggered ON scheduled_executions(triggered_at);
";

/// Persistent storage for scheduled tasks and their execution history.
pub struct ScheduleStore {
    db: Arc<dyn SQLStore>,
}

impl ScheduleStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("schedule schema init: {e}")))?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Scheduled tasks
    // -----------------------------------------------------------------------

    pub fn create(&self, task: &ScheduledTask) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.db
            .exec(
                "INSERT INTO scheduled_tasks (id, data, enabled, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                &[
                    Value::Text(task.id.clone()),
                    Value::Text(data),
                    Value::Integer(task.enabled as i64),
                    Value::Text(task.created_at.clone()),
                ],
            )
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint") {
                    ServiceError::Conflict(format!("scheduled task {} already exists", task.id))
                } else {
                    ServiceError::Storage(msg)
                }
            })?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ScheduledTask, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM scheduled_tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("scheduled task {id}")))?;
        row_to_scheduled_task(row)
    }

    pub fn update(&self, task: &ScheduledTask) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;
        let affected = self
            .db
            .exec(
                "UPDATE scheduled_tasks SET data = ?1, enabled = ?2 WHERE id = ?3",
                &[
                    Value::Text(data),
                    Value::Integer(task.enabled as i64),
                    Value::Text(task.id.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("scheduled task {}", task.id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM scheduled_tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("scheduled task {id}")));
        }
        Ok(())
    }

    pub fn list(&self, offset: i64, limit: i64) -> Result<ListResult<ScheduledTask>, ServiceError> {
        let count = self
            .db
            .query("SELECT COUNT(*) AS cnt FROM scheduled_tasks", &[])
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = count.first().and_then(|r| r.get_i64("cnt")).unwrap_or(0) as usize;

        let rows = self
            .db
            .query(
                "SELECT data FROM scheduled_tasks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                &[Value::Integer(limit), Value::Integer(offset)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let items = rows
            .iter()
            .map(row_to_scheduled_task)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ListResult { items, total })
    }

    pub fn list_enabled(&self) -> Result<Vec<ScheduledTask>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM scheduled_tasks WHERE enabled = 1 ORDER BY created_at ASC",
                &[],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.iter().map(row_to_scheduled_task).collect()
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert an execution row and fill in its generated id.
    pub fn create_execution(&self, execution: &mut ScheduledExecution) -> Result<(), ServiceError> {
        self.db
            .exec(
                "INSERT INTO scheduled_executions \
                 (scheduled_task_id, task_id, status, triggered_at, started_at, finished_at, \
                  duration_seconds, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                &[
                    Value::Text(execution.scheduled_task_id.clone()),
                    Value::Text(execution.task_id.clone()),
                    Value::Text(execution.status.as_str().to_string()),
                    Value::Text(execution.triggered_at.clone()),
                    Value::Text(execution.started_at.clone()),
                    match &execution.finished_at {
                        Some(ts) => Value::Text(ts.clone()),
                        None => Value::Null,
                    },
                    Value::Real(execution.duration_seconds),
                    Value::Text(execution.error_message.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let rows = self
            .db
            .query("SELECT last_insert_rowid() AS id", &[])
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        execution.id = rows
            .first()
            .and_then(|r| r.get_i64("id"))
            .ok_or_else(|| ServiceError::Storage("missing last insert id".into()))?;
        Ok(())
    }

    pub fn update_execution(&self, execution: &ScheduledExecution) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "UPDATE scheduled_executions SET task_id = ?1, status = ?2, finished_at = ?3, \
                 duration_seconds = ?4, error_message = ?5 WHERE id = ?6",
                &[
                    Value::Text(execution.task_id.clone()),
                    Value::Text(execution.status.as_str().to_string()),
                    match &execution.finished_at {
                        Some(ts) => Value::Text(ts.clone()),
                        None => Value::Null,
                    },
                    Value::Real(execution.duration_seconds),
                    Value::Text(execution.error_message.clone()),
                    Value::Integer(execution.id),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "scheduled execution {}",
                execution.id
            )));
        }
        Ok(())
    }

    pub fn get_execution(&self, id: i64) -> Result<ScheduledExecution, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM scheduled_executions WHERE id = ?1",
                &[Value::Integer(id)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("scheduled execution {id}")))?;
        row_to_execution(row)
    }

    pub fn list_executions(
        &self,
        scheduled_task_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<ListResult<ScheduledExecution>, ServiceError> {
        let count = self
            .db
            .query(
                "SELECT COUNT(*) AS cnt FROM scheduled_executions WHERE scheduled_task_id = ?1",
                &[Value::Text(scheduled_task_id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = count.first().and_then(|r| r.get_i64("cnt")).unwrap_or(0) as usize;

        let rows = self
            .db
            .query(
                "SELECT * FROM scheduled_executions WHERE scheduled_task_id = ?1 \
                 ORDER BY triggered_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                &[
                    Value::Text(scheduled_task_id.to_string()),
                    Value::Integer(limit),
                    Value::Integer(offset),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let items = rows
            .iter()
            .map(row_to_execution)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ListResult { items, total })
    }

    /// Executions of this scheduled task that have not finished yet.
    pub fn list_running_executions(
        &self,
        scheduled_task_id: &str,
    ) -> Result<Vec<ScheduledExecution>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT * FROM scheduled_executions \
                 WHERE scheduled_task_id = ?1 AND finished_at IS NULL",
                &[Value::Text(scheduled_task_id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.iter().map(row_to_execution).collect()
    }

    /// Delete executions triggered before the cutoff. Returns the count.
    pub fn delete_executions_before(&self, cutoff: &str) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "DELETE FROM scheduled_executions WHERE triggered_at < ?1",
                &[Value::Text(cutoff.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }
}

fn row_to_scheduled_task(row: &Row) -> Result<ScheduledTask, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json)
        .map_err(|e| ServiceError::Storage(format!("bad scheduled task json: {e}")))
}

fn row_to_execution(row: &Row) -> Result<ScheduledExecution, ServiceError> {
    let status = row
        .get_str("status")
        .and_then(ExecutionStatus::from_str)
        .ok_or_else(|| ServiceError::Storage("bad execution status column".into()))?;
    Ok(ScheduledExecution {
        id: row
            .get_i64("id")
            .ok_or_else(|| ServiceError::Storage("missing id column".into()))?,
        scheduled_task_id: row
            .get_str("scheduled_task_id")
            .unwrap_or_default()
            .to_string(),
        task_id: row.get_str("task_id").unwrap_or_default().to_string(),
        status,
        triggered_at: row.get_str("triggered_at").unwrap_or_default().to_string(),
        started_at: row.get_str("started_at").unwrap_or_default().to_string(),
        finished_at: row.get_str("finished_at").map(|s| s.to_string()),
        duration_seconds: row.get_f64("duration_seconds").unwrap_or(0.0),
        error_message: row.get_str("error_message").unwrap_or_default().to_string(),
    })
}
