//! External-system interfaces the PipelineExecutor drives through. Concrete
//! adapters live under `adapters/`; the executor itself only ever depends on
//! these traits, so it can be driven by fakes in tests.

use async_trait::async_trait;

use crate::errors::{DomainError, DomainResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRef {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: i64,
}

/// Code-hosting platform (e.g. a forge's REST API). All methods may fail
/// with a provider error; `create_branch_proposal` additionally recognises
/// a "no commits between branches" condition the caller must special-case.
#[async_trait]
pub trait CodeHostClient: Send + Sync {
    async fn create_branch_proposal(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<ProposalRef>;

    async fn list_proposals_for_branch(&self, branch: &str) -> DomainResult<Vec<ProposalRef>>;

    /// Best-effort: callers must treat a returned `false` or an error the
    /// same way — log and continue, never fail the pipeline over it.
    async fn comment_on_issue(&self, issue_number: i64, text: &str) -> DomainResult<bool>;

    async fn rate_limit(&self) -> DomainResult<RateLimitStatus>;

    /// True iff `error` represents the platform's "no commits between
    /// branches" condition rather than a genuine failure.
    fn is_no_commits_error(&self, error: &DomainError) -> bool;
}

/// Local working-copy operations. Implementations shell out to a VCS binary
/// or an embedded library; either way, one working tree is touched by at
/// most one in-flight pipeline (see ConcurrencyGate capacity 1 default).
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn create_feature_branch(&self, issue_number: i64) -> DomainResult<String>;

    async fn branch_exists(&self, branch_name: &str) -> DomainResult<bool>;

    async fn checkout_branch(&self, branch_name: &str) -> DomainResult<()>;

    async fn has_uncommitted_changes(&self) -> DomainResult<bool>;

    /// Returns `false` if there was nothing to commit.
    async fn commit_all(&self, message: &str) -> DomainResult<bool>;

    async fn push(&self, branch_name: &str) -> DomainResult<()>;
}
