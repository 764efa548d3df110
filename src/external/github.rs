//! GitHub CLI abstractions
//!
//! Provides trait-based abstractions for the review system, enabling testable
//! review-request and ticket integrations through dependency injection.
//! Authentication lives entirely inside the `gh` CLI.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use super::command::{CommandError, CommandExecutor};

pub type TicketId = u64;
pub type ReviewId = u64;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone)]
pub struct ReviewRequestConfig {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

/// Merge/close state as reported by the review system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteReviewState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ReviewSnapshot {
    pub id: ReviewId,
    pub state: RemoteReviewState,
    pub labels: Vec<String>,
    pub head_branch: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSummary {
    pub id: ReviewId,
    pub title: String,
    pub head_branch: String,
}

/// An inline review comment, with the diff context the API attaches to it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub path: Option<String>,
    pub line: Option<u32>,
    pub start_line: Option<u32>,
    pub diff_hunk: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReviewError {
    #[error("GitHub CLI is not authenticated; run `gh auth login`")]
    AuthenticationFailed,
    #[error("Review or ticket not found: {message}")]
    NotFound { message: String },
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("GitHub CLI failed: {message}")]
    CliFailed { message: String },
    #[error("Command execution error: {source}")]
    CommandError {
        #[from]
        source: CommandError,
    },
    #[error("Invalid response from GitHub CLI: {message}")]
    InvalidResponse { message: String },
}

/// Trait for review-system operations
///
/// This abstraction enables testing review integrations without actual
/// GitHub API calls.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReviewOperations: Send + Sync {
    /// Fail fast when the CLI has no session
    async fn auth_status(&self) -> Result<(), ReviewError>;

    /// Open a review request and return its number
    async fn create_review(&self, config: &ReviewRequestConfig) -> Result<ReviewId, ReviewError>;

    /// Current state of a review request
    async fn view_review(&self, id: ReviewId) -> Result<ReviewSnapshot, ReviewError>;

    /// List review requests by state (`open`, `closed`, `merged`, `all`)
    async fn list_reviews(&self, state: &str) -> Result<Vec<ReviewSummary>, ReviewError>;

    /// Inline review comments on a review request
    async fn review_comments(&self, id: ReviewId) -> Result<Vec<ReviewComment>, ReviewError>;

    async fn comment_review(&self, id: ReviewId, body: &str) -> Result<(), ReviewError>;

    /// Ask the review system to merge once requirements are met
    async fn enable_auto_merge(&self, id: ReviewId) -> Result<(), ReviewError>;

    async fn create_ticket(&self, title: &str, body: &str, labels: &[String]) -> Result<TicketId, ReviewError>;

    async fn comment_ticket(&self, id: TicketId, body: &str) -> Result<(), ReviewError>;

    async fn close_ticket(&self, id: TicketId) -> Result<(), ReviewError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewPayload {
    number: u64,
    state: String,
    #[serde(default)]
    labels: Vec<LabelPayload>,
    #[serde(default)]
    head_ref_name: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPayload {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    head_ref_name: String,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    id: u64,
    #[serde(default)]
    body: String,
    user: Option<UserPayload>,
    path: Option<String>,
    line: Option<u32>,
    original_line: Option<u32>,
    start_line: Option<u32>,
    diff_hunk: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

/// Real GitHub CLI implementation
pub struct GitHubClient {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    root: PathBuf,
}

impl GitHubClient {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            program: program.into(),
            root: root.into(),
        }
    }

    async fn execute_gh_command(&self, args: &[&str]) -> Result<String, ReviewError> {
        let output = self.executor.execute(&self.program, args, &self.root).await?;

        if !output.success() {
            return Err(self.classify_gh_error(&output.stderr));
        }

        Ok(output.stdout)
    }

    fn classify_gh_error(&self, stderr: &str) -> ReviewError {
        let lowered = stderr.to_lowercase();
        if lowered.contains("not logged in")
            || lowered.contains("not authenticated")
            || lowered.contains("authentication failed")
            || lowered.contains("gh auth login")
        {
            ReviewError::AuthenticationFailed
        } else if lowered.contains("rate limit") {
            ReviewError::RateLimitExceeded
        } else if lowered.contains("not found") || lowered.contains("could not resolve") {
            ReviewError::NotFound {
                message: stderr.trim().to_string(),
            }
        } else {
            ReviewError::CliFailed {
                message: stderr.trim().to_string(),
            }
        }
    }

    fn parse_id_from_url(&self, url: &str) -> Result<u64, ReviewError> {
        url.trim()
            .lines()
            .last()
            .unwrap_or("")
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ReviewError::InvalidResponse {
                message: format!("Could not parse number from URL: {}", url.trim()),
            })
    }

    fn parse_json<T: for<'de> Deserialize<'de>>(output: &str, what: &str) -> Result<T, ReviewError> {
        serde_json::from_str(output).map_err(|e| ReviewError::InvalidResponse {
            message: format!("Failed to parse {what} JSON: {e}"),
        })
    }

    fn parse_state(state: &str) -> Result<RemoteReviewState, ReviewError> {
        match state.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(RemoteReviewState::Open),
            "MERGED" => Ok(RemoteReviewState::Merged),
            "CLOSED" => Ok(RemoteReviewState::Closed),
            other => Err(ReviewError::InvalidResponse {
                message: format!("Unknown review state '{other}'"),
            }),
        }
    }
}

#[async_trait]
impl ReviewOperations for GitHubClient {
    async fn auth_status(&self) -> Result<(), ReviewError> {
        self.execute_gh_command(&["auth", "status"]).await?;
        Ok(())
    }

    async fn create_review(&self, config: &ReviewRequestConfig) -> Result<ReviewId, ReviewError> {
        let args = [
            "pr", "create",
            "--title", config.title.as_str(),
            "--body", config.body.as_str(),
            "--head", config.head_branch.as_str(),
            "--base", config.base_branch.as_str(),
        ];

        let output = self.execute_gh_command(&args).await?;
        self.parse_id_from_url(&output)
    }

    async fn view_review(&self, id: ReviewId) -> Result<ReviewSnapshot, ReviewError> {
        let id_str = id.to_string();
        let args = ["pr", "view", id_str.as_str(), "--json", "number,state,labels,headRefName,url"];

        let output = self.execute_gh_command(&args).await?;
        let payload: ViewPayload = Self::parse_json(&output, "review")?;

        Ok(ReviewSnapshot {
            id: payload.number,
            state: Self::parse_state(&payload.state)?,
            labels: payload.labels.into_iter().map(|l| l.name).collect(),
            head_branch: payload.head_ref_name,
            url: payload.url,
        })
    }

    async fn list_reviews(&self, state: &str) -> Result<Vec<ReviewSummary>, ReviewError> {
        let args = ["pr", "list", "--state", state, "--json", "number,title,headRefName"];

        let output = self.execute_gh_command(&args).await?;
        let payload: Vec<ListPayload> = Self::parse_json(&output, "review list")?;

        Ok(payload
            .into_iter()
            .map(|p| ReviewSummary {
                id: p.number,
                title: p.title,
                head_branch: p.head_ref_name,
            })
            .collect())
    }

    async fn review_comments(&self, id: ReviewId) -> Result<Vec<ReviewComment>, ReviewError> {
        // gh expands {owner}/{repo} from the current repository
        let endpoint = format!("repos/{{owner}}/{{repo}}/pulls/{id}/comments");
        let args = ["api", "--paginate", endpoint.as_str()];

        let output = self.execute_gh_command(&args).await?;
        let payload: Vec<CommentPayload> = Self::parse_json(&output, "review comments")?;

        Ok(payload
            .into_iter()
            .map(|c| ReviewComment {
                id: c.id,
                author: c.user.map(|u| u.login).unwrap_or_default(),
                body: c.body,
                path: c.path,
                line: c.line.or(c.original_line),
                start_line: c.start_line,
                diff_hunk: c.diff_hunk,
            })
            .collect())
    }

    async fn comment_review(&self, id: ReviewId, body: &str) -> Result<(), ReviewError> {
        let id_str = id.to_string();
        self.execute_gh_command(&["pr", "comment", &id_str, "--body", body]).await?;
        Ok(())
    }

    async fn enable_auto_merge(&self, id: ReviewId) -> Result<(), ReviewError> {
        let id_str = id.to_string();
        self.execute_gh_command(&["pr", "merge", &id_str, "--auto", "--squash"]).await?;
        Ok(())
    }

    async fn create_ticket(&self, title: &str, body: &str, labels: &[String]) -> Result<TicketId, ReviewError> {
        let mut args = vec!["issue", "create", "--title", title, "--body", body];

        for label in labels {
            args.push("--label");
            args.push(label);
        }

        let output = self.execute_gh_command(&args).await?;
        self.parse_id_from_url(&output)
    }

    async fn comment_ticket(&self, id: TicketId, body: &str) -> Result<(), ReviewError> {
        let id_str = id.to_string();
        self.execute_gh_command(&["issue", "comment", &id_str, "--body", body]).await?;
        Ok(())
    }

    async fn close_ticket(&self, id: TicketId) -> Result<(), ReviewError> {
        let id_str = id.to_string();
        self.execute_gh_command(&["issue", "close", &id_str]).await?;
        Ok(())
    }
}
