//! `SourceControl` backed by the system `git` binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::{DomainError, DomainResult};
use crate::ports::SourceControl;

/// Shells out to `git` in a fixed working tree. One `GitCli` drives one
/// repository checkout; callers are expected to serialise access to it (see
/// `ConcurrencyGate` capacity 1 default) since branch/checkout operations
/// mutate the single working directory in place.
pub struct GitCli {
    repo_path: PathBuf,
    remote: String,
    default_branch: String,
    branch_template: String,
}

impl GitCli {
    pub fn new(repo_path: impl Into<PathBuf>, remote: String, default_branch: String, branch_template: String) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote,
            default_branch,
            branch_template,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_path).args(args);
        cmd
    }

    async fn run_status(&self, args: &[&str]) -> DomainResult<bool> {
        let status = self
            .command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DomainError::Process(format!("failed to run git {args:?}: {e}")))?;
        Ok(status.success())
    }

    async fn run_output(&self, args: &[&str]) -> DomainResult<String> {
        let output = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::Process(format!("failed to run git {args:?}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DomainError::Process(format!(
                "git {args:?} failed: {stderr}"
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn create_feature_branch(&self, issue_number: i64) -> DomainResult<String> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| DomainError::Process(format!("system clock before epoch: {e}")))?
            .as_secs();
        let branch_name = self
            .branch_template
            .replace("{issue_number}", &issue_number.to_string())
            .replace("{timestamp}", &timestamp.to_string());

        self.run_output(&["checkout", &self.default_branch]).await?;
        self.run_output(&["pull", &self.remote, &self.default_branch])
            .await?;
        self.run_output(&["checkout", "-b", &branch_name]).await?;

        tracing::info!(branch_name, "created feature branch");
        Ok(branch_name)
    }

    async fn branch_exists(&self, branch_name: &str) -> DomainResult<bool> {
        self.run_status(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch_name}"),
        ])
        .await
    }

    async fn checkout_branch(&self, branch_name: &str) -> DomainResult<()> {
        self.run_output(&["checkout", branch_name]).await?;
        Ok(())
    }

    async fn has_uncommitted_changes(&self) -> DomainResult<bool> {
        let porcelain = self.run_output(&["status", "--porcelain"]).await?;
        Ok(!porcelain.trim().is_empty())
    }

    async fn commit_all(&self, message: &str) -> DomainResult<bool> {
        if !self.has_uncommitted_changes().await? {
            return Ok(false);
        }
        self.run_output(&["add", "-A"]).await?;
        // `-A` may stage only ignored-but-tracked deletions that net out to
        // nothing; re-check the index before committing.
        let staged = self.run_output(&["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        self.run_output(&["commit", "-m", message]).await?;
        Ok(true)
    }

    async fn push(&self, branch_name: &str) -> DomainResult<()> {
        self.run_output(&["push", "-u", &self.remote, branch_name])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &std::path::Path) {
        std::process::Command::new("git")
            .current_dir(dir)
            .args(["init", "-q"])
            .status()
            .expect("git init");
        std::process::Command::new("git")
            .current_dir(dir)
            .args(["config", "user.email", "test@example.com"])
            .status()
            .expect("git config email");
        std::process::Command::new("git")
            .current_dir(dir)
            .args(["config", "user.name", "Test"])
            .status()
            .expect("git config name");
        std::fs::write(dir.join("README.md"), "hello\n").expect("write file");
        std::process::Command::new("git")
            .current_dir(dir)
            .args(["add", "-A"])
            .status()
            .expect("git add");
        std::process::Command::new("git")
            .current_dir(dir)
            .args(["commit", "-q", "-m", "initial"])
            .status()
            .expect("git commit");
        std::process::Command::new("git")
            .current_dir(dir)
            .args(["branch", "-M", "main"])
            .status()
            .expect("git branch -M main");
    }

    #[tokio::test]
    async fn has_uncommitted_changes_reflects_working_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path());
        let git = GitCli::new(
            dir.path(),
            "origin".to_string(),
            "main".to_string(),
            "devpilot/issue-{issue_number}-{timestamp}".to_string(),
        );

        assert!(!git.has_uncommitted_changes().await.unwrap());

        std::fs::write(dir.path().join("new.txt"), "content\n").unwrap();
        assert!(git.has_uncommitted_changes().await.unwrap());
    }

    #[tokio::test]
    async fn commit_all_reports_false_when_nothing_to_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path());
        let git = GitCli::new(
            dir.path(),
            "origin".to_string(),
            "main".to_string(),
            "devpilot/issue-{issue_number}-{timestamp}".to_string(),
        );

        assert!(!git.commit_all("nothing to see here").await.unwrap());
    }

    #[tokio::test]
    async fn commit_all_commits_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path());
        let git = GitCli::new(
            dir.path(),
            "origin".to_string(),
            "main".to_string(),
            "devpilot/issue-{issue_number}-{timestamp}".to_string(),
        );

        std::fs::write(dir.path().join("new.txt"), "content\n").unwrap();
        assert!(git.commit_all("add new.txt").await.unwrap());
        assert!(!git.has_uncommitted_changes().await.unwrap());
    }

    #[tokio::test]
    async fn branch_exists_is_false_for_unknown_branch() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path());
        let git = GitCli::new(
            dir.path(),
            "origin".to_string(),
            "main".to_string(),
            "devpilot/issue-{issue_number}-{timestamp}".to_string(),
        );

        assert!(!git.branch_exists("does-not-exist").await.unwrap());
        assert!(git.branch_exists("main").await.unwrap());
    }
}
