//! Drives one `Task` through branch-prep, agent execution, commit, push and
//! proposal creation, writing a `TaskLog` entry at every stage boundary.

use std::sync::Arc;
use std::time::Instant;

use crate::agent_runner::AgentRunner;
use crate::concurrency_gate::ConcurrencyGate;
use crate::config::Config;
use crate::domain::{LogLevel, Task, TaskDescriptor, TaskStatus};
use crate::errors::{DomainError, DomainResult};
use crate::ports::{CodeHostClient, SourceControl};
use crate::task_store::{TaskOutcome, TaskStore};

const NO_SUMMARY_WARNING: &str = "no summary";

pub struct PipelineExecutor {
    store: Arc<dyn TaskStore>,
    gate: ConcurrencyGate,
    agent_runner: Arc<AgentRunner>,
    code_host: Arc<dyn CodeHostClient>,
    source_control: Arc<dyn SourceControl>,
    config: Config,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        gate: ConcurrencyGate,
        agent_runner: Arc<AgentRunner>,
        code_host: Arc<dyn CodeHostClient>,
        source_control: Arc<dyn SourceControl>,
        config: Config,
    ) -> Self {
        Self {
            store,
            gate,
            agent_runner,
            code_host,
            source_control,
            config,
        }
    }

    /// Runs a brand-new task from a freshly-triggered descriptor: branch
    /// prep, task creation, then the shared stage sequence. The gate permit
    /// is held for the full call and released on every exit path when the
    /// guard drops at the end of this function.
    pub async fn execute_new(&self, task_id: &str, descriptor: TaskDescriptor) -> DomainResult<Task> {
        let _permit = self.gate.acquire().await;

        let branch_name = self
            .source_control
            .create_feature_branch(descriptor.issue_number)
            .await?;

        let task = self
            .store
            .create_task(task_id, descriptor, &branch_name)
            .await?;
        self.store
            .transition(task_id, TaskStatus::Running, TaskOutcome::default())
            .await?;
        self.store
            .append_log(
                task_id,
                LogLevel::Info,
                &format!("stage 1/6: branch prep complete: {branch_name}"),
            )
            .await?;

        self.run_stages(task_id, task.descriptor(), &branch_name)
            .await
    }

    /// Resumes a FAILED/CANCELLED task: re-uses its existing branch if it is
    /// still present, otherwise recreates it, then runs the shared stage
    /// sequence. Callers are expected to have already called
    /// `TaskStore::retry` to re-PEND the task.
    pub async fn execute_retry(&self, task_id: &str) -> DomainResult<Task> {
        let _permit = self.gate.acquire().await;

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;

        let branch_name = if self.source_control.branch_exists(&task.branch_name).await? {
            self.source_control.checkout_branch(&task.branch_name).await?;
            self.store
                .append_log(
                    task_id,
                    LogLevel::Info,
                    &format!("stage 1/6: resumed existing branch: {}", task.branch_name),
                )
                .await?;
            task.branch_name.clone()
        } else {
            let recreated = self
                .source_control
                .create_feature_branch(task.issue_number)
                .await?;
            self.store
                .append_log(
                    task_id,
                    LogLevel::Warning,
                    &format!("stage 1/6: branch was missing, recreated: {recreated}"),
                )
                .await?;
            recreated
        };

        self.store
            .transition(task_id, TaskStatus::Running, TaskOutcome::default())
            .await?;

        self.run_stages(task_id, task.descriptor(), &branch_name)
            .await
    }

    /// Stages 2 through 6. `task_id`'s task must already be RUNNING with
    /// `branch_name` checked out.
    async fn run_stages(
        &self,
        task_id: &str,
        descriptor: TaskDescriptor,
        branch_name: &str,
    ) -> DomainResult<Task> {
        let started = Instant::now();

        // Stage 2: agent run.
        let outcome = self
            .agent_runner
            .run(task_id, &descriptor, self.store.as_ref())
            .await?;

        if outcome.cancelled {
            self.store
                .transition(
                    task_id,
                    TaskStatus::Cancelled,
                    TaskOutcome {
                        error_message: Some("cancelled by user".to_string()),
                        ..TaskOutcome::default()
                    },
                )
                .await?;
            self.notify_best_effort(descriptor.issue_number, "\u{23f9}\u{fe0f} AI development task was cancelled")
                .await;
            return self.get_task(task_id).await;
        }

        if !outcome.success {
            let message = outcome
                .error_message
                .unwrap_or_else(|| "agent execution failed".to_string());
            self.store
                .transition(
                    task_id,
                    TaskStatus::Failed,
                    TaskOutcome {
                        error_message: Some(message.clone()),
                        success: Some(false),
                        ..TaskOutcome::default()
                    },
                )
                .await?;
            self.notify_best_effort(
                descriptor.issue_number,
                &format!("\u{274c} AI development failed: {message}"),
            )
            .await;
            return self.get_task(task_id).await;
        }

        self.store
            .append_log(task_id, LogLevel::Info, "stage 2/6: agent run complete")
            .await?;

        if outcome.aggregated_text.trim().is_empty() {
            self.store
                .append_log(task_id, LogLevel::Warning, NO_SUMMARY_WARNING)
                .await?;
        }

        // Stage 3: commit.
        if self.source_control.has_uncommitted_changes().await? {
            let message = self
                .config
                .commit_template
                .replace("{issue_title}", &descriptor.issue_title);
            self.source_control.commit_all(&message).await?;
            self.store
                .append_log(task_id, LogLevel::Info, "stage 3/6: committed remaining changes")
                .await?;
        } else {
            self.store
                .append_log(task_id, LogLevel::Info, "stage 3/6: no uncommitted changes")
                .await?;
        }

        // Stage 4: push.
        if let Err(err) = self.source_control.push(branch_name).await {
            self.store
                .transition(
                    task_id,
                    TaskStatus::Failed,
                    TaskOutcome {
                        error_message: Some(format!("push failed: {err}")),
                        success: Some(false),
                        ..TaskOutcome::default()
                    },
                )
                .await?;
            self.notify_best_effort(
                descriptor.issue_number,
                &format!("\u{274c} AI development failed: push failed: {err}"),
            )
            .await;
            return self.get_task(task_id).await;
        }
        self.store
            .append_log(task_id, LogLevel::Info, "stage 4/6: pushed to remote")
            .await?;

        // Stage 5: proposal creation. A detected rate-limit breach fails the
        // run outright rather than letting the proposal call below retry
        // blindly into the same wall.
        if let Some(reason) = self.rate_limit_breach(task_id).await? {
            self.store
                .transition(
                    task_id,
                    TaskStatus::Failed,
                    TaskOutcome {
                        error_message: Some(reason.clone()),
                        success: Some(false),
                        ..TaskOutcome::default()
                    },
                )
                .await?;
            self.notify_best_effort(
                descriptor.issue_number,
                &format!("\u{274c} AI development failed: {reason}"),
            )
            .await;
            return self.get_task(task_id).await;
        }

        let execution_time = started.elapsed().as_secs_f64();
        let title = format!("AI: {}", descriptor.issue_title);
        let body = format!(
            "Issue: #{}\n\n{}\n\nExecution time: {:.1}s",
            descriptor.issue_number, outcome.aggregated_text, execution_time
        );

        let proposal = match self
            .code_host
            .create_branch_proposal(branch_name, &self.config.repository.default_branch, &title, &body)
            .await
        {
            Ok(proposal) => Some(proposal),
            Err(err) if self.code_host.is_no_commits_error(&err) => {
                let existing = self
                    .code_host
                    .list_proposals_for_branch(branch_name)
                    .await
                    .unwrap_or_default();
                if let Some(existing) = existing.into_iter().next() {
                    self.store
                        .append_log(
                            task_id,
                            LogLevel::Info,
                            &format!("stage 5/6: adopted existing proposal #{}", existing.number),
                        )
                        .await?;
                    Some(existing)
                } else {
                    let warning = format!(
                        "AI development complete, but produced no new commits; branch '{branch_name}' may already be in sync."
                    );
                    self.store
                        .append_log(task_id, LogLevel::Warning, &warning)
                        .await?;
                    self.notify_best_effort(descriptor.issue_number, &warning).await;
                    None
                }
            }
            Err(err) => {
                self.store
                    .transition(
                        task_id,
                        TaskStatus::Failed,
                        TaskOutcome {
                            error_message: Some(format!("proposal creation failed: {err}")),
                            success: Some(false),
                            ..TaskOutcome::default()
                        },
                    )
                    .await?;
                self.notify_best_effort(
                    descriptor.issue_number,
                    &format!("\u{274c} AI development failed: proposal creation failed: {err}"),
                )
                .await;
                return self.get_task(task_id).await;
            }
        };

        // Stage 6: finalise.
        let development_summary = if outcome.aggregated_text.trim().is_empty() {
            None
        } else {
            Some(outcome.aggregated_text.clone())
        };

        self.store
            .transition(
                task_id,
                TaskStatus::Completed,
                TaskOutcome {
                    success: Some(true),
                    execution_time_seconds: Some(execution_time),
                    proposal_number: proposal.as_ref().map(|p| p.number),
                    proposal_url: proposal.as_ref().map(|p| p.url.clone()),
                    development_summary,
                    ..TaskOutcome::default()
                },
            )
            .await?;

        if let Some(proposal) = &proposal {
            self.notify_best_effort(
                descriptor.issue_number,
                &format!(
                    "\u{2705} AI development complete! Created proposal #{}: {}",
                    proposal.number, proposal.url
                ),
            )
            .await;
        }

        self.get_task(task_id).await
    }

    async fn get_task(&self, task_id: &str) -> DomainResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))
    }

    /// Comments on the source issue. Never propagates failure: logged and
    /// swallowed per the pipeline's non-fatal-notification policy.
    async fn notify_best_effort(&self, issue_number: i64, text: &str) {
        match self.code_host.comment_on_issue(issue_number, text).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(issue_number, "issue comment reported failure"),
            Err(err) => tracing::warn!(issue_number, error = %err, "issue comment failed"),
        }
    }

    /// Queries the provider's current rate limit and returns a failure
    /// reason if it is exhausted. A failed query itself is not a breach:
    /// logged and treated as "proceed", since the subsequent provider call
    /// will surface any real outage on its own.
    async fn rate_limit_breach(&self, task_id: &str) -> DomainResult<Option<String>> {
        match self.code_host.rate_limit().await {
            Ok(status) if status.remaining == 0 => {
                let reason = format!(
                    "provider rate limit exhausted ({}/{}, resets at {})",
                    status.remaining, status.limit, status.reset_at
                );
                self.store
                    .append_log(task_id, LogLevel::Warning, &reason)
                    .await?;
                Ok(Some(reason))
            }
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::warn!(task_id, error = %err, "rate limit check failed, proceeding without it");
                Ok(None)
            }
        }
    }
}
