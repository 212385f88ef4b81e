use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::domain::{LogLevel, Task, TaskDescriptor, TaskLog, TaskStatus};
use crate::errors::{DomainError, DomainResult};

use super::{TaskOutcome, TaskStats, TaskStore};

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    issue_number: i64,
    issue_title: String,
    issue_url: String,
    issue_body: String,
    branch_name: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    success: Option<i64>,
    error_message: Option<String>,
    execution_time_seconds: Option<f64>,
    proposal_number: Option<i64>,
    proposal_url: Option<String>,
    development_summary: Option<String>,
    retry_count: i64,
    max_retries: i64,
}

fn parse_datetime(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Serialization(e.to_string()))
}

fn parse_optional_datetime(s: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_datetime(&s)).transpose()
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| DomainError::Serialization(format!("invalid status: {}", row.status)))?;

        Ok(Task {
            task_id: row.task_id,
            issue_number: row.issue_number,
            issue_title: row.issue_title,
            issue_url: row.issue_url,
            issue_body: row.issue_body,
            branch_name: row.branch_name,
            status,
            created_at: parse_datetime(&row.created_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            success: row.success.map(|v| v != 0),
            error_message: row.error_message,
            execution_time_seconds: row.execution_time_seconds,
            proposal_number: row.proposal_number,
            proposal_url: row.proposal_url,
            development_summary: row.development_summary,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(
        &self,
        task_id: &str,
        descriptor: TaskDescriptor,
        branch_name: &str,
    ) -> DomainResult<Task> {
        let task = Task::new(task_id.to_string(), descriptor, branch_name.to_string());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO tasks (task_id, issue_number, issue_title, issue_url, issue_body,
                branch_name, status, created_at, retry_count, max_retries)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(task.issue_number)
        .bind(&task.issue_title)
        .bind(&task.issue_url)
        .bind(&task.issue_body)
        .bind(&task.branch_name)
        .bind(task.status.as_str())
        .bind(task.created_at.to_rfc3339())
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .execute(&mut *tx)
        .await?;

        self.append_log_tx(&mut tx, task_id, LogLevel::Info, "task created").await?;
        tx.commit().await?;

        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        outcome: TaskOutcome,
    ) -> DomainResult<Task> {
        let mut task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;

        if !task.status.can_transition_to(status) {
            return Err(DomainError::InvalidTransition {
                from: task.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        let now = Utc::now();
        task.status = status;

        if status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }

        if let Some(v) = outcome.error_message {
            task.error_message = Some(v);
        }
        if let Some(v) = outcome.success {
            task.success = Some(v);
        }
        if let Some(v) = outcome.execution_time_seconds {
            task.execution_time_seconds = Some(v);
        }
        if let Some(v) = outcome.proposal_number {
            task.proposal_number = Some(v);
        }
        if let Some(v) = outcome.proposal_url {
            task.proposal_url = Some(v);
        }
        if let Some(v) = outcome.development_summary {
            task.development_summary = Some(v);
        }

        let mut tx = self.pool.begin().await?;
        self.persist_tx(&mut tx, &task).await?;

        let log_message = match status {
            TaskStatus::Running => "task started",
            TaskStatus::Completed => "task completed",
            TaskStatus::Failed => "task failed",
            TaskStatus::Cancelled => "task cancelled",
            TaskStatus::Pending => "task reset to pending",
        };
        self.append_log_tx(&mut tx, task_id, LogLevel::Info, log_message).await?;
        tx.commit().await?;

        Ok(task)
    }

    async fn retry(&self, task_id: &str) -> DomainResult<Task> {
        let mut task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;

        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(DomainError::RetryRejected(format!(
                "task {task_id} is in {} state, not retryable",
                task.status.as_str()
            )));
        }
        if task.retry_count >= task.max_retries {
            return Err(DomainError::RetryRejected(format!(
                "task {task_id} has exhausted its {} retries",
                task.max_retries
            )));
        }

        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.error_message = None;
        task.started_at = None;
        task.completed_at = None;
        task.success = None;

        let mut tx = self.pool.begin().await?;
        self.persist_tx(&mut tx, &task).await?;
        self.append_log_tx(
            &mut tx,
            task_id,
            LogLevel::Info,
            &format!("task retry (attempt {})", task.retry_count),
        )
        .await?;
        tx.commit().await?;

        Ok(task)
    }

    async fn tasks_by_issue(&self, issue_number: i64) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE issue_number = ? ORDER BY created_at DESC",
        )
        .bind(issue_number)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = if let Some(status) = status {
            sqlx::query_as(
                "SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(status.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?")
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
        };
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn append_log(&self, task_id: &str, level: LogLevel, message: &str) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO task_logs (task_id, level, message, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(level.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_logs_since(&self, task_id: &str, after_id: i64, limit: i64) -> DomainResult<Vec<TaskLog>> {
        let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(
            "SELECT id, task_id, level, message, timestamp FROM task_logs
             WHERE task_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(task_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, task_id, level, message, timestamp)| {
                Ok(TaskLog {
                    id,
                    task_id,
                    level: LogLevel::parse(&level)
                        .ok_or_else(|| DomainError::Serialization(format!("invalid log level: {level}")))?,
                    message,
                    timestamp: parse_datetime(&timestamp)?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> DomainResult<TaskStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            let count = count as u64;
            stats.total += count;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => stats.pending = count,
                Some(TaskStatus::Running) => stats.running = count,
                Some(TaskStatus::Completed) => stats.completed = count,
                Some(TaskStatus::Failed) => stats.failed = count,
                Some(TaskStatus::Cancelled) => stats.cancelled = count,
                None => {}
            }
        }
        Ok(stats)
    }
}

impl SqliteTaskStore {
    /// Updates `task`'s mutable columns within `tx`. Callers are responsible
    /// for committing `tx`, typically alongside an [`append_log_tx`] call so
    /// the Task mutation and its log entry land in one atomic write group.
    async fn persist_tx(&self, tx: &mut Transaction<'_, Sqlite>, task: &Task) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET
                branch_name = ?, status = ?, started_at = ?, completed_at = ?, success = ?,
                error_message = ?, execution_time_seconds = ?, proposal_number = ?,
                proposal_url = ?, development_summary = ?, retry_count = ?, max_retries = ?
             WHERE task_id = ?",
        )
        .bind(&task.branch_name)
        .bind(task.status.as_str())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.success.map(i64::from))
        .bind(&task.error_message)
        .bind(task.execution_time_seconds)
        .bind(task.proposal_number)
        .bind(&task.proposal_url)
        .bind(&task.development_summary)
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(&task.task_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task.task_id.clone()));
        }
        Ok(())
    }

    /// Same as [`TaskStore::append_log`], scoped to an in-flight `tx` so it
    /// commits atomically with the Task mutation it accompanies.
    async fn append_log_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        task_id: &str,
        level: LogLevel,
        message: &str,
    ) -> DomainResult<()> {
        sqlx::query("INSERT INTO task_logs (task_id, level, message, timestamp) VALUES (?, ?, ?, ?)")
            .bind(task_id)
            .bind(level.as_str())
            .bind(message)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
