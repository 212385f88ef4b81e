//! Spawns the external AI coding agent as a supervised child process and
//! reduces its streamed stdout into a structured [`AgentOutcome`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::domain::{TaskDescriptor, TaskStatus};
use crate::errors::DomainResult;
use crate::process_supervisor::ProcessSupervisor;
use crate::task_store::TaskStore;

/// Truncation boundary for captured stderr, matching the original
/// implementation's `stderr_content[:5000]`.
const STDERR_TAIL_BYTES: usize = 5000;

const PLACEHOLDER_EMPTY_BODY: &str = "(no description provided)";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_path: String,
    pub skip_permissions: bool,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub repository_path: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolUse {
    pub name: String,
    pub id: String,
}

/// Result of one complete `run` call (covering all retry attempts).
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub aggregated_text: String,
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub tool_uses: Vec<ToolUse>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub turns: Option<u64>,
    pub session_id: Option<String>,
    pub parse_errors: Vec<String>,
    pub error_message: Option<String>,
}

/// One parsed line of the agent's structured stdout stream.
#[derive(Debug, Clone, PartialEq)]
enum StreamRecord {
    /// An `assistant` record carries zero or more text blocks and zero or
    /// more tool-use blocks; both accumulate independently per block, as
    /// the agent CLI itself sends them.
    Assistant {
        text: String,
        tool_uses: Vec<ToolUse>,
    },
    Result {
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
        turns: Option<u64>,
        session_id: Option<String>,
    },
    Error(String),
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    name: Option<String>,
    id: Option<String>,
}

/// Renders the deterministic prompt sent to the agent. Empty bodies render
/// as a literal placeholder rather than an empty string.
pub fn render_prompt(descriptor: &TaskDescriptor) -> String {
    let body = if descriptor.issue_body.trim().is_empty() {
        PLACEHOLDER_EMPTY_BODY
    } else {
        descriptor.issue_body.as_str()
    };
    format!(
        "Resolve issue #{number}: {title}\n\nURL: {url}\n\n{body}",
        number = descriptor.issue_number,
        title = descriptor.issue_title,
        url = descriptor.issue_url,
        body = body,
    )
}

fn parse_line(line: &str) -> Result<StreamRecord, String> {
    let value: Value = serde_json::from_str(line).map_err(|_| truncate(line, 200))?;
    let record_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match record_type {
        "assistant" => {
            let blocks: Vec<ContentBlock> = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| serde_json::from_value(c.clone()).ok())
                .unwrap_or_default();

            let mut text = String::new();
            let mut tool_uses = Vec::new();
            for block in blocks {
                match block.block_type.as_str() {
                    "text" => {
                        if let Some(t) = block.text {
                            text.push_str(&t);
                        }
                    }
                    "tool_use" => {
                        tool_uses.push(ToolUse {
                            name: block.name.unwrap_or_else(|| "unknown".to_string()),
                            id: block.id.unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            Ok(StreamRecord::Assistant { text, tool_uses })
        }
        "result" => Ok(StreamRecord::Result {
            cost_usd: value.get("cost_usd").and_then(Value::as_f64),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            turns: value.get("num_turns").and_then(Value::as_u64),
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "error" => Ok(StreamRecord::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )),
        _ => Ok(StreamRecord::Unknown),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

/// Runs the external agent, retrying transient failures with a bounded
/// exponential backoff and checking for externally-observed cancellation
/// between attempts.
pub struct AgentRunner {
    config: AgentConfig,
    supervisor: Arc<ProcessSupervisor>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { config, supervisor }
    }

    pub async fn run(
        &self,
        task_id: &str,
        descriptor: &TaskDescriptor,
        store: &dyn TaskStore,
    ) -> DomainResult<AgentOutcome> {
        let prompt = render_prompt(descriptor);
        let mut last_outcome = AgentOutcome::default();

        for attempt in 1..=self.config.max_retries {
            if let Some(task) = store.get_task(task_id).await? {
                if task.status == TaskStatus::Cancelled {
                    tracing::info!(task_id, "task cancelled before agent attempt");
                    return Ok(AgentOutcome {
                        cancelled: true,
                        ..AgentOutcome::default()
                    });
                }
            }

            store
                .append_log(
                    task_id,
                    crate::domain::LogLevel::Info,
                    &format!("agent attempt {attempt}/{}", self.config.max_retries),
                )
                .await?;

            let outcome = self.run_once(task_id, &prompt).await;

            if outcome.cancelled || outcome.success {
                return Ok(outcome);
            }

            last_outcome = outcome;

            if attempt < self.config.max_retries {
                let wait = backoff_seconds(attempt);
                store
                    .append_log(
                        task_id,
                        crate::domain::LogLevel::Warning,
                        &format!(
                            "agent attempt {attempt} failed: {}; retrying in {wait}s",
                            last_outcome.error_message.as_deref().unwrap_or("unknown error")
                        ),
                    )
                    .await?;
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        }

        Ok(last_outcome)
    }

    async fn run_once(&self, task_id: &str, prompt: &str) -> AgentOutcome {
        let mut args = vec![
            "--prompt".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if self.config.skip_permissions {
            args.push("--skip-permissions".to_string());
        }

        let mut command = Command::new(&self.config.agent_path);
        command
            .args(&args)
            .current_dir(&self.config.repository_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return AgentOutcome {
                    success: false,
                    error_message: Some(format!("failed to spawn agent: {err}")),
                    ..AgentOutcome::default()
                }
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_seconds);

        self.supervisor.register(task_id, child).await;

        let drained = tokio::time::timeout(timeout, drain_streams(stdout, stderr)).await;
        let exit_status = self.supervisor.finish(task_id).await;

        match drained {
            Ok(mut outcome) => {
                outcome.duration_ms.get_or_insert(started.elapsed().as_millis() as u64);
                outcome.exit_code = exit_status.and_then(|s| s.code());
                let no_error = outcome.error_message.is_none();
                let zero_exit = outcome.exit_code == Some(0);
                outcome.success = zero_exit && no_error;
                outcome
            }
            Err(_) => AgentOutcome {
                success: false,
                error_message: Some(format!(
                    "agent timed out after {}s",
                    self.config.timeout_seconds
                )),
                exit_code: exit_status.and_then(|s| s.code()),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                ..AgentOutcome::default()
            },
        }
    }
}

/// Reads stdout line-by-line, parsing each into a [`StreamRecord`], while
/// concurrently capturing a truncated stderr tail. Malformed lines are
/// counted but never abort parsing.
async fn drain_streams(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
) -> AgentOutcome {
    let mut outcome = AgentOutcome::default();
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr);
    let mut stderr_buf = String::new();

    let stderr_task = async {
        use tokio::io::AsyncReadExt;
        let _ = stderr_reader.read_to_string(&mut stderr_buf).await;
    };

    let stdout_task = async {
        while let Ok(Some(line)) = stdout_lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(StreamRecord::Assistant { text, tool_uses }) => {
                    outcome.aggregated_text.push_str(&text);
                    outcome.tool_uses.extend(tool_uses);
                }
                Ok(StreamRecord::Result {
                    cost_usd,
                    duration_ms,
                    turns,
                    session_id,
                }) => {
                    outcome.cost_usd = cost_usd;
                    outcome.duration_ms = duration_ms;
                    outcome.turns = turns;
                    outcome.session_id = session_id;
                }
                Ok(StreamRecord::Error(message)) => {
                    outcome.error_message.get_or_insert(message);
                }
                Ok(StreamRecord::Unknown) => {}
                Err(truncated) => {
                    outcome.parse_errors.push(truncated);
                }
            }
        }
    };

    tokio::join!(stdout_task, stderr_task);

    outcome.stderr_tail = truncate(&stderr_buf, STDERR_TAIL_BYTES);
    outcome
}

/// `min(2^attempt, 10)` seconds, matching the original retry cadence.
fn backoff_seconds(attempt: u32) -> u64 {
    2u64.saturating_pow(attempt).min(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_renders_as_placeholder() {
        let descriptor = TaskDescriptor {
            issue_number: 1,
            issue_title: "Title".to_string(),
            issue_url: "https://example.test/1".to_string(),
            issue_body: String::new(),
        };
        let prompt = render_prompt(&descriptor);
        assert!(prompt.contains(PLACEHOLDER_EMPTY_BODY));
    }

    #[test]
    fn non_empty_body_is_preserved() {
        let descriptor = TaskDescriptor {
            issue_number: 1,
            issue_title: "Title".to_string(),
            issue_url: "https://example.test/1".to_string(),
            issue_body: "Steps to reproduce".to_string(),
        };
        let prompt = render_prompt(&descriptor);
        assert!(prompt.contains("Steps to reproduce"));
    }

    #[test]
    fn backoff_is_bounded_at_ten_seconds() {
        assert_eq!(backoff_seconds(1), 2);
        assert_eq!(backoff_seconds(2), 4);
        assert_eq!(backoff_seconds(3), 8);
        assert_eq!(backoff_seconds(4), 10);
        assert_eq!(backoff_seconds(10), 10);
    }

    #[test]
    fn parses_assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            StreamRecord::Assistant {
                text: "hello".to_string(),
                tool_uses: Vec::new(),
            }
        );
    }

    #[test]
    fn assistant_record_accumulates_text_and_tool_uses_independently() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"first "},
            {"type":"tool_use","name":"read_file","id":"t1"},
            {"type":"text","text":"second"},
            {"type":"tool_use","name":"write_file","id":"t2"}
        ]}}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(
            parsed,
            StreamRecord::Assistant {
                text: "first second".to_string(),
                tool_uses: vec![
                    ToolUse {
                        name: "read_file".to_string(),
                        id: "t1".to_string(),
                    },
                    ToolUse {
                        name: "write_file".to_string(),
                        id: "t2".to_string(),
                    },
                ],
            }
        );
    }

    #[test]
    fn parses_result_record() {
        let line = r#"{"type":"result","cost_usd":0.5,"duration_ms":1200,"num_turns":3,"session_id":"abc"}"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(
            parsed,
            StreamRecord::Result {
                cost_usd: Some(0.5),
                duration_ms: Some(1200),
                turns: Some(3),
                session_id: Some("abc".to_string()),
            }
        );
    }

    #[test]
    fn parses_error_record() {
        let line = r#"{"type":"error","message":"boom"}"#;
        assert_eq!(parse_line(line).unwrap(), StreamRecord::Error("boom".to_string()));
    }

    #[test]
    fn unknown_type_does_not_fail_parsing() {
        let line = r#"{"type":"heartbeat"}"#;
        assert_eq!(parse_line(line).unwrap(), StreamRecord::Unknown);
    }

    #[test]
    fn malformed_line_is_reported_not_fatal() {
        let result = parse_line("not json at all");
        assert!(result.is_err());
    }
}
