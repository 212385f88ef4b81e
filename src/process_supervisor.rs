//! Tracks and terminates the subprocess backing each task's in-flight agent
//! attempt, so a cancelled or superseded task can be killed from outside
//! the `AgentRunner` that spawned it.

use std::collections::HashMap;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;

const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Registry of running agent subprocesses, keyed by `task_id`. One process
/// per task at a time; registering a second process for the same task_id
/// replaces the first in the map (the caller is expected to have already
/// terminated it).
pub struct ProcessSupervisor {
    processes: Mutex<HashMap<String, Child>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, task_id: &str, child: Child) {
        let pid = child.id();
        self.processes
            .lock()
            .await
            .insert(task_id.to_string(), child);
        tracing::info!(task_id, pid, "registered agent process");
    }

    pub async fn unregister(&self, task_id: &str) {
        if self.processes.lock().await.remove(task_id).is_some() {
            tracing::info!(task_id, "unregistered agent process");
        }
    }

    /// Whether a process is still registered and has not yet exited. Reaps
    /// and unregisters it if it has exited without anyone calling
    /// `unregister` explicitly.
    pub async fn is_running(&self, task_id: &str) -> bool {
        let mut processes = self.processes.lock().await;
        let Some(child) = processes.get_mut(task_id) else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(_status)) => {
                processes.remove(task_id);
                false
            }
            Ok(None) => true,
            Err(_) => true,
        }
    }

    pub async fn running_task_ids(&self) -> Vec<String> {
        let mut processes = self.processes.lock().await;
        let mut finished = Vec::new();
        let mut running = Vec::new();
        for (task_id, child) in processes.iter_mut() {
            match child.try_wait() {
                Ok(Some(_)) => finished.push(task_id.clone()),
                _ => running.push(task_id.clone()),
            }
        }
        for task_id in finished {
            processes.remove(&task_id);
        }
        running
    }

    /// Graceful-then-forceful termination: sends `SIGTERM`, waits up to
    /// [`GRACE_PERIOD`], then escalates to `SIGKILL`. Returns `true` if a
    /// process was found and terminated, `false` if none was registered.
    pub async fn terminate(&self, task_id: &str) -> bool {
        let mut child = match self.processes.lock().await.remove(task_id) {
            Some(child) => child,
            None => {
                tracing::warn!(task_id, "no process registered for termination");
                return false;
            }
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(task_id, ?status, "process already exited");
            return false;
        }

        if let Some(pid) = child.id() {
            tracing::info!(task_id, pid, "sending SIGTERM");
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(task_id, ?status, "process exited gracefully");
            }
            Ok(Err(err)) => {
                tracing::error!(task_id, error = %err, "error waiting for process exit");
            }
            Err(_) => {
                tracing::warn!(task_id, "grace period elapsed, sending SIGKILL");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        true
    }

    /// Reaps a process's exit status, terminating it first if it is still
    /// running. Unlike [`terminate`](Self::terminate), this always returns
    /// the exit status when one is available, whether the process exited on
    /// its own or had to be killed.
    pub async fn finish(&self, task_id: &str) -> Option<std::process::ExitStatus> {
        let mut child = self.processes.lock().await.remove(task_id)?;

        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }

        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) => None,
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        }
    }

    /// Forcefully kills every registered process. Intended for shutdown.
    pub async fn terminate_all(&self) {
        let mut processes = self.processes.lock().await;
        let count = processes.len();
        tracing::info!(count, "terminating all registered processes");
        for (task_id, child) in processes.iter_mut() {
            if let Err(err) = child.start_kill() {
                tracing::error!(task_id, error = %err, "failed to kill process");
            }
        }
        processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn sleep_child(seconds: u64) -> Child {
        Command::new("sleep")
            .arg(seconds.to_string())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep")
    }

    #[tokio::test]
    async fn register_and_terminate_running_process() {
        let supervisor = ProcessSupervisor::new();
        supervisor.register("t1", sleep_child(30)).await;
        assert!(supervisor.is_running("t1").await);

        let terminated = supervisor.terminate("t1").await;
        assert!(terminated);
        assert!(!supervisor.is_running("t1").await);
    }

    #[tokio::test]
    async fn terminate_unknown_task_returns_false() {
        let supervisor = ProcessSupervisor::new();
        assert!(!supervisor.terminate("missing").await);
    }

    #[tokio::test]
    async fn unregister_drops_tracking_without_killing() {
        let supervisor = ProcessSupervisor::new();
        supervisor.register("t2", sleep_child(1)).await;
        supervisor.unregister("t2").await;
        assert!(!supervisor.is_running("t2").await);
    }

    #[tokio::test]
    async fn running_task_ids_reaps_exited_processes() {
        let supervisor = ProcessSupervisor::new();
        supervisor.register("t3", sleep_child(0)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let running = supervisor.running_task_ids().await;
        assert!(!running.contains(&"t3".to_string()));
    }
}
