//! The sole writer of `Task`/`TaskLog` rows: enforces the lifecycle state
//! machine, owns retry accounting, and serves the `LogStreamer`'s polling
//! reads.

mod connection;
mod migrations;
mod sqlite;

pub use connection::connect;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;

use crate::domain::{Task, TaskDescriptor, TaskLog, TaskStatus};
use crate::errors::DomainResult;

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Fields a terminal status update may carry, mirroring the original
/// `update_task_status` keyword arguments. All optional: only the fields the
/// caller passes are applied.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub error_message: Option<String>,
    pub success: Option<bool>,
    pub execution_time_seconds: Option<f64>,
    pub proposal_number: Option<i64>,
    pub proposal_url: Option<String>,
    pub development_summary: Option<String>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(
        &self,
        task_id: &str,
        descriptor: TaskDescriptor,
        branch_name: &str,
    ) -> DomainResult<Task>;

    async fn get_task(&self, task_id: &str) -> DomainResult<Option<Task>>;

    /// Moves `task_id` to `status`, applying the allowed-edge check from
    /// `TaskStatus::can_transition_to`, stamping `started_at`/`completed_at`
    /// as appropriate, and merging in any `outcome` fields supplied.
    async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        outcome: TaskOutcome,
    ) -> DomainResult<Task>;

    /// Resets a `FAILED`/`CANCELLED` task back to `PENDING`, incrementing
    /// `retry_count`, clearing `error_message`/`started_at`/`completed_at`/
    /// `success`, and leaving `branch_name` untouched. Rejects if the task
    /// is not in a retryable state or `retry_count >= max_retries`.
    async fn retry(&self, task_id: &str) -> DomainResult<Task>;

    async fn tasks_by_issue(&self, issue_number: i64) -> DomainResult<Vec<Task>>;

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> DomainResult<Vec<Task>>;

    async fn append_log(&self, task_id: &str, level: crate::domain::LogLevel, message: &str) -> DomainResult<()>;

    async fn read_logs_since(&self, task_id: &str, after_id: i64, limit: i64) -> DomainResult<Vec<TaskLog>>;

    async fn stats(&self) -> DomainResult<TaskStats>;
}
