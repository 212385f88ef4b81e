//! On-demand follower that tails a task's log entries until it reaches a
//! terminal state, for consumption by the (out-of-scope) HTTP layer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};

use crate::domain::TaskLog;
use crate::task_store::TaskStore;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One frame of a log stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    Data(TaskLog),
    Done,
    Error(String),
}

struct StreamState {
    store: Arc<dyn TaskStore>,
    task_id: String,
    last_id_seen: i64,
    poll_interval: Duration,
    closed: bool,
    /// Entries fetched but not yet emitted. `read_logs_since` returns up to
    /// 100 rows per poll; the cursor (`last_id_seen`) advances past the
    /// whole batch immediately, so every row in it must be queued here
    /// rather than dropped after the first.
    pending: VecDeque<TaskLog>,
}

/// Builds the push stream described in `spec.md` §4.7: polls
/// `ReadLogsSince` at `poll_interval`, re-reads task status after each poll,
/// and terminates with exactly one `Done` or `Error` frame.
pub fn follow(store: Arc<dyn TaskStore>, task_id: impl Into<String>) -> impl Stream<Item = LogFrame> {
    follow_with_interval(store, task_id, DEFAULT_POLL_INTERVAL)
}

pub fn follow_with_interval(
    store: Arc<dyn TaskStore>,
    task_id: impl Into<String>,
    poll_interval: Duration,
) -> impl Stream<Item = LogFrame> {
    let state = StreamState {
        store,
        task_id: task_id.into(),
        last_id_seen: 0,
        poll_interval,
        closed: false,
        pending: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        if let Some(log) = state.pending.pop_front() {
            return Some((LogFrame::Data(log), state));
        }

        if state.closed {
            return None;
        }

        loop {
            let logs = match state
                .store
                .read_logs_since(&state.task_id, state.last_id_seen, 100)
                .await
            {
                Ok(logs) => logs,
                Err(err) => {
                    state.closed = true;
                    return Some((LogFrame::Error(err.to_string()), state));
                }
            };

            if let Some(last) = logs.last() {
                state.last_id_seen = last.id;
            }
            state.pending.extend(logs);

            if let Some(log) = state.pending.pop_front() {
                return Some((LogFrame::Data(log), state));
            }

            match state.store.get_task(&state.task_id).await {
                Ok(None) => {
                    state.closed = true;
                    return Some((
                        LogFrame::Error(format!("task not found: {}", state.task_id)),
                        state,
                    ));
                }
                Ok(Some(task)) if task.status.is_terminal() => {
                    state.closed = true;
                    return Some((LogFrame::Done, state));
                }
                Ok(Some(_)) => {
                    tokio::time::sleep(state.poll_interval).await;
                }
                Err(err) => {
                    state.closed = true;
                    return Some((LogFrame::Error(err.to_string()), state));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::Mutex;

    use crate::domain::{LogLevel, Task, TaskDescriptor, TaskStatus};
    use crate::errors::DomainResult;
    use crate::task_store::{TaskOutcome, TaskStats};

    struct FakeStore {
        task: Mutex<Task>,
        logs: Mutex<Vec<TaskLog>>,
    }

    impl FakeStore {
        fn new(status: TaskStatus) -> Self {
            let descriptor = TaskDescriptor {
                issue_number: 1,
                issue_title: "t".to_string(),
                issue_url: "u".to_string(),
                issue_body: "b".to_string(),
            };
            let mut task = Task::new("task-1-1".to_string(), descriptor, "branch".to_string());
            task.status = status;
            Self {
                task: Mutex::new(task),
                logs: Mutex::new(Vec::new()),
            }
        }

        async fn push_log(&self, message: &str) {
            let mut logs = self.logs.lock().await;
            let id = logs.len() as i64 + 1;
            logs.push(TaskLog {
                id,
                task_id: "task-1-1".to_string(),
                level: LogLevel::Info,
                message: message.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }

        async fn finish(&self) {
            self.task.lock().await.status = TaskStatus::Completed;
        }
    }

    #[async_trait]
    impl TaskStore for FakeStore {
        async fn create_task(
            &self,
            _task_id: &str,
            _descriptor: TaskDescriptor,
            _branch_name: &str,
        ) -> DomainResult<Task> {
            unimplemented!()
        }

        async fn get_task(&self, _task_id: &str) -> DomainResult<Option<Task>> {
            Ok(Some(self.task.lock().await.clone()))
        }

        async fn transition(
            &self,
            _task_id: &str,
            _status: TaskStatus,
            _outcome: TaskOutcome,
        ) -> DomainResult<Task> {
            unimplemented!()
        }

        async fn retry(&self, _task_id: &str) -> DomainResult<Task> {
            unimplemented!()
        }

        async fn tasks_by_issue(&self, _issue_number: i64) -> DomainResult<Vec<Task>> {
            unimplemented!()
        }

        async fn list_tasks(
            &self,
            _status: Option<TaskStatus>,
            _limit: i64,
            _offset: i64,
        ) -> DomainResult<Vec<Task>> {
            unimplemented!()
        }

        async fn append_log(&self, _task_id: &str, _level: LogLevel, _message: &str) -> DomainResult<()> {
            unimplemented!()
        }

        async fn read_logs_since(&self, _task_id: &str, after_id: i64, _limit: i64) -> DomainResult<Vec<TaskLog>> {
            let logs = self.logs.lock().await;
            Ok(logs.iter().filter(|l| l.id > after_id).cloned().collect())
        }

        async fn stats(&self) -> DomainResult<TaskStats> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn emits_logs_then_done_on_terminal_status() {
        let store = Arc::new(FakeStore::new(TaskStatus::Running));
        store.push_log("first").await;
        store.push_log("second").await;
        store.finish().await;

        let frames: Vec<LogFrame> =
            follow_with_interval(store, "task-1-1", Duration::from_millis(5))
                .collect()
                .await;

        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], LogFrame::Data(l) if l.message == "first"));
        assert!(matches!(&frames[1], LogFrame::Data(l) if l.message == "second"));
        assert_eq!(frames[2], LogFrame::Done);
    }

    #[tokio::test]
    async fn emits_error_when_task_vanishes() {
        struct VanishingStore(FakeStore);

        #[async_trait]
        impl TaskStore for VanishingStore {
            async fn create_task(&self, t: &str, d: TaskDescriptor, b: &str) -> DomainResult<Task> {
                self.0.create_task(t, d, b).await
            }
            async fn get_task(&self, _task_id: &str) -> DomainResult<Option<Task>> {
                Ok(None)
            }
            async fn transition(&self, t: &str, s: TaskStatus, o: TaskOutcome) -> DomainResult<Task> {
                self.0.transition(t, s, o).await
            }
            async fn retry(&self, t: &str) -> DomainResult<Task> {
                self.0.retry(t).await
            }
            async fn tasks_by_issue(&self, i: i64) -> DomainResult<Vec<Task>> {
                self.0.tasks_by_issue(i).await
            }
            async fn list_tasks(&self, s: Option<TaskStatus>, l: i64, o: i64) -> DomainResult<Vec<Task>> {
                self.0.list_tasks(s, l, o).await
            }
            async fn append_log(&self, t: &str, l: LogLevel, m: &str) -> DomainResult<()> {
                self.0.append_log(t, l, m).await
            }
            async fn read_logs_since(&self, t: &str, a: i64, l: i64) -> DomainResult<Vec<TaskLog>> {
                self.0.read_logs_since(t, a, l).await
            }
            async fn stats(&self) -> DomainResult<TaskStats> {
                self.0.stats().await
            }
        }

        let store = Arc::new(VanishingStore(FakeStore::new(TaskStatus::Running)));
        let frames: Vec<LogFrame> =
            follow_with_interval(store, "task-1-1", Duration::from_millis(5))
                .collect()
                .await;

        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], LogFrame::Error(_)));
    }
}
