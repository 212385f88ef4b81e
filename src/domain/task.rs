//! Task and TaskLog data model plus the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Task`].
///
/// Transitions are restricted to the edges enumerated in `spec.md` §4.6:
/// `PENDING -> RUNNING`, `PENDING -> CANCELLED`, `RUNNING -> COMPLETED`,
/// `RUNNING -> FAILED`, `RUNNING -> CANCELLED`, `FAILED -> PENDING`,
/// `CANCELLED -> PENDING`. Any other edge is rejected by the [`TaskStore`](crate::task_store::TaskStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
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
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an allowed edge per `spec.md` §4.6.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

/// Log severity for a [`TaskLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// The issue-derived fields needed to create a [`Task`] and to render the
/// agent prompt. Separated from `Task` because callers (trigger evaluation,
/// the pipeline's prompt renderer) only ever need this subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_url: String,
    pub issue_body: String,
}

/// One AI development attempt for one issue. See `spec.md` §3 for the full
/// invariant list; `TaskStore` is the only component permitted to mutate
/// these fields once a `PipelineExecutor` has released ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_url: String,
    pub issue_body: String,
    pub branch_name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Tri-state: `None` = unset, `Some(true)`/`Some(false)` otherwise.
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub execution_time_seconds: Option<f64>,
    pub proposal_number: Option<i64>,
    pub proposal_url: Option<String>,
    pub development_summary: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    /// Build a fresh `PENDING` task for a newly-accepted trigger.
    pub fn new(task_id: String, descriptor: TaskDescriptor, branch_name: String) -> Self {
        Self {
            task_id,
            issue_number: descriptor.issue_number,
            issue_title: descriptor.issue_title,
            issue_url: descriptor.issue_url,
            issue_body: descriptor.issue_body,
            branch_name,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            success: None,
            error_message: None,
            execution_time_seconds: None,
            proposal_number: None,
            proposal_url: None,
            development_summary: None,
            retry_count: 0,
            max_retries: 2,
        }
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            issue_number: self.issue_number,
            issue_title: self.issue_title.clone(),
            issue_url: self.issue_url.clone(),
            issue_body: self.issue_body.clone(),
        }
    }
}

/// An append-only log entry on a [`Task`]. Ordering is by insertion; `id` is
/// monotone within a `task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Derive a stable task identifier, `task-<issue_number>-<epoch_seconds>`.
pub fn new_task_id(issue_number: i64, epoch_seconds: i64) -> String {
    format!("task-{issue_number}-{epoch_seconds}")
}
