//! `CodeHostClient` backed by the GitHub REST API v3.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::errors::{DomainError, DomainResult};
use crate::ports::{CodeHostClient, ProposalRef, RateLimitStatus};

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Token-bucket rate limiter. GitHub allows 5 000 authenticated requests
/// per hour; [`acquire`](RateLimiter::acquire) sleeps once the bucket is
/// exhausted rather than letting a request fail.
#[derive(Debug)]
struct RateLimiter {
    capacity: u32,
    tokens: u32,
    window: Duration,
    window_start: Instant,
}

impl RateLimiter {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            tokens: capacity,
            window,
            window_start: Instant::now(),
        }
    }

    async fn acquire(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.window {
            self.tokens = self.capacity;
            self.window_start = Instant::now();
        }

        if self.tokens > 0 {
            self.tokens -= 1;
        } else {
            let remaining = self.window.saturating_sub(elapsed);
            tracing::warn!(
                sleep_ms = remaining.as_millis() as u64,
                "GitHub rate limit reached, sleeping"
            );
            tokio::time::sleep(remaining).await;
            self.tokens = self.capacity - 1;
            self.window_start = Instant::now();
        }
    }
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: i64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Debug, Deserialize)]
struct RateLimitCore {
    remaining: u32,
    limit: u32,
    reset: i64,
}

/// HTTP client for the subset of the GitHub REST API `PipelineExecutor`
/// needs: opening a pull request, finding one that already exists for a
/// branch, commenting on the source issue, and reading the current rate
/// limit.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    token: String,
    owner: String,
    repo: String,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl GitHubClient {
    pub fn new(token: String, owner: String, repo: String) -> Self {
        Self {
            http: Client::new(),
            token,
            owner,
            repo,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(5_000, Duration::from_secs(3_600)))),
        }
    }

    /// Reads `GITHUB_TOKEN`, `GITHUB_OWNER`, and `GITHUB_REPO` from the
    /// environment.
    pub fn from_env() -> Result<Self, String> {
        Self::from_var_results(
            std::env::var("GITHUB_TOKEN"),
            std::env::var("GITHUB_OWNER"),
            std::env::var("GITHUB_REPO"),
        )
    }

    /// Builds a client from already-looked-up environment variable results.
    /// Split out from [`from_env`](Self::from_env) so the missing/empty-token
    /// cases are testable without mutating real process environment state.
    fn from_var_results(
        token: Result<String, std::env::VarError>,
        owner: Result<String, std::env::VarError>,
        repo: Result<String, std::env::VarError>,
    ) -> Result<Self, String> {
        let token = token.map_err(|_| "GITHUB_TOKEN environment variable is not set".to_string())?;
        if token.is_empty() {
            return Err("GITHUB_TOKEN environment variable is empty".to_string());
        }
        let owner = owner.map_err(|_| "GITHUB_OWNER environment variable is not set".to_string())?;
        let repo = repo.map_err(|_| "GITHUB_REPO environment variable is not set".to_string())?;
        Ok(Self::new(token, owner, repo))
    }

    async fn rate_limited_request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.rate_limiter.lock().await.acquire().await;
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "devpilot")
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!("{}/repos/{}/{}{}", GITHUB_API_BASE, self.owner, self.repo, suffix)
    }
}

#[async_trait]
impl CodeHostClient for GitHubClient {
    async fn create_branch_proposal(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<ProposalRef> {
        let url = self.repo_url("/pulls");
        let request_body = serde_json::json!({
            "title": title,
            "body": body,
            "head": branch,
            "base": base,
        });

        let resp = self
            .rate_limited_request(reqwest::Method::POST, &url)
            .await
            .json(&request_body)
            .send()
            .await
            .map_err(|e| DomainError::Provider(format!("create pull request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(DomainError::Provider(format!(
                "create pull request returned {status}: {body_text}"
            )));
        }

        let parsed: PullRequestResponse = resp
            .json()
            .await
            .map_err(|e| DomainError::Provider(format!("create pull request parse failed: {e}")))?;
        Ok(ProposalRef {
            number: parsed.number,
            url: parsed.html_url,
        })
    }

    async fn list_proposals_for_branch(&self, branch: &str) -> DomainResult<Vec<ProposalRef>> {
        let url = format!(
            "{}&head={}:{}",
            self.repo_url("/pulls?state=open"),
            self.owner,
            branch
        );

        let resp = self
            .rate_limited_request(reqwest::Method::GET, &url)
            .await
            .send()
            .await
            .map_err(|e| DomainError::Provider(format!("list pull requests failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(DomainError::Provider(format!(
                "list pull requests returned {status}: {body_text}"
            )));
        }

        let parsed: Vec<PullRequestResponse> = resp
            .json()
            .await
            .map_err(|e| DomainError::Provider(format!("list pull requests parse failed: {e}")))?;
        Ok(parsed
            .into_iter()
            .map(|pr| ProposalRef {
                number: pr.number,
                url: pr.html_url,
            })
            .collect())
    }

    async fn comment_on_issue(&self, issue_number: i64, text: &str) -> DomainResult<bool> {
        let url = self.repo_url(&format!("/issues/{issue_number}/comments"));
        let body = serde_json::json!({ "body": text });

        let resp = self
            .rate_limited_request(reqwest::Method::POST, &url)
            .await
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                tracing::warn!(issue_number, status = %resp.status(), "issue comment rejected");
                Ok(false)
            }
            Err(e) => Err(DomainError::Provider(format!("comment on issue failed: {e}"))),
        }
    }

    async fn rate_limit(&self) -> DomainResult<RateLimitStatus> {
        let url = format!("{GITHUB_API_BASE}/rate_limit");
        let resp = self
            .rate_limited_request(reqwest::Method::GET, &url)
            .await
            .send()
            .await
            .map_err(|e| DomainError::Provider(format!("rate limit request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(DomainError::Provider(format!(
                "rate limit returned {status}: {body_text}"
            )));
        }

        let parsed: RateLimitResponse = resp
            .json()
            .await
            .map_err(|e| DomainError::Provider(format!("rate limit parse failed: {e}")))?;
        Ok(RateLimitStatus {
            remaining: parsed.resources.core.remaining,
            limit: parsed.resources.core.limit,
            reset_at: parsed.resources.core.reset,
        })
    }

    fn is_no_commits_error(&self, error: &DomainError) -> bool {
        let text = error.to_string().to_lowercase();
        text.contains("no commits between") || text.contains("没有新的提交")
    }
}
