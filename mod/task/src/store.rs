use std::sync::Arc;

use prewarm_core::{ListResult, ServiceError};
use prewarm_sql::{Row, SQLStore, Value};

use crate::model::{Task, TaskStatus};

/// SQL schema for the tasks table. Complex fields live in the JSON `data`
/// column; the indexed columns exist for filtering and ordering only.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    data        TEXT NOT NULL,
    status      TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
";

/// Persistent storage for tasks, backed by SQLStore (SQLite).
pub struct TaskStore {
    db: Arc<dyn SQLStore>,
}

impl TaskStore {
    /// Create a new TaskStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        Ok(Self { db })
    }

    /// Insert a new task.
    pub fn create(&self, task: &Task) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO tasks (id, data, status, priority, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[
                    Value::Text(task.id.clone()),
                    Value::Text(data),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Integer(task.priority),
                    Value::Text(task.created_at.clone()),
                ],
            )
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint") {
                    ServiceError::Conflict(format!("task {} already exists", task.id))
                } else {
                    ServiceError::Storage(msg)
                }
            })?;

        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Task, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT data FROM tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;

        row_to_task(row)
    }

    /// Update a task (full replacement of the data column + indexed columns).
    pub fn update(&self, task: &Task) -> Result<(), ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                "UPDATE tasks SET data = ?1, status = ?2 WHERE id = ?3",
                &[
                    Value::Text(data),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Text(task.id.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Update, unless the stored record was cancelled meanwhile.
    ///
    /// `DeleteTask` writes the cancelled status from outside the task's
    /// execution runner; reconciliation and retry writes go through
    /// this guard so they can never resurrect a cancelled task. Returns
    /// false when the write was skipped.
    pub fn update_if_not_cancelled(&self, task: &Task) -> Result<bool, ServiceError> {
        let data =
            serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                "UPDATE tasks SET data = ?1, status = ?2 WHERE id = ?3 AND status != 'cancelled'",
                &[
                    Value::Text(data),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Text(task.id.clone()),
                ],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if affected == 0 {
            // Distinguish a cancelled row from a missing one.
            self.get(&task.id)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Delete a task by ID.
    pub fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(
                "DELETE FROM tasks WHERE id = ?1",
                &[Value::Text(id.to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// List tasks newest-first with offset/limit pagination.
    pub fn list(&self, offset: i64, limit: i64) -> Result<ListResult<Task>, ServiceError> {
        let count_rows = self
            .db
            .query("SELECT COUNT(*) AS cnt FROM tasks", &[])
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        let rows = self
            .db
            .query(
                "SELECT data FROM tasks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                &[Value::Integer(limit), Value::Integer(offset)],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let items = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListResult { items, total })
    }

    /// Count tasks currently in the given status.
    pub fn count_status(&self, status: TaskStatus) -> Result<i64, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT COUNT(*) AS cnt FROM tasks WHERE status = ?1",
                &[Value::Text(status.as_str().to_string())],
            )
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(rows.first().and_then(|r| r.get_i64("cnt")).unwrap_or(0))
    }
}

/// Deserialize a Task from a row's `data` JSON column.
fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json).map_err(|e| ServiceError::Storage(format!("bad task json: {e}")))
}
