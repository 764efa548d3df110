//! Git command abstractions
//!
//! Provides trait-based abstractions for Git operations, enabling testable
//! Git integrations through dependency injection. Every call shells out to
//! the configured git binary inside the project root.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::command::{CommandError, CommandExecutor};

pub type BranchName = String;
pub type CommitHash = String;

/// Field separator used in `--format` strings.
const FIELD_SEP: char = '\u{1f}';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GitError {
    #[error("Repository not found or not a git repository")]
    RepositoryNotFound,
    #[error("Branch not found: {branch}")]
    BranchNotFound { branch: BranchName },
    #[error("Conflict while running `{command}`: {stderr}")]
    Conflict { command: String, stderr: String },
    #[error("Push rejected: {stderr}")]
    PushRejected { command: String, stderr: String },
    #[error("Command execution error: {source}")]
    CommandError {
        #[from]
        source: CommandError,
    },
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    GitCommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("Could not parse git output: {message}")]
    Parse { message: String },
}

impl GitError {
    /// Captured stderr, when the failure came from git itself.
    pub fn stderr(&self) -> String {
        match self {
            GitError::Conflict { stderr, .. }
            | GitError::PushRejected { stderr, .. }
            | GitError::GitCommandFailed { stderr, .. } => stderr.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Hard,
}

impl ResetMode {
    fn flag(self) -> &'static str {
        match self {
            ResetMode::Soft => "--soft",
            ResetMode::Hard => "--hard",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitStatus {
    pub current_branch: Option<BranchName>,
    pub is_clean: bool,
    pub staged_files: Vec<String>,
    pub unstaged_files: Vec<String>,
    pub untracked_files: Vec<String>,
}

impl GitStatus {
    pub fn has_staged_changes(&self) -> bool {
        !self.staged_files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: CommitHash,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
}

/// Trait for Git repository operations
///
/// This abstraction enables testing Git operations without actual repository
/// manipulation, while preserving the exact interface used by the engine.
#[async_trait]
pub trait GitRepository: Send + Sync {
    /// Root of the working tree this repository operates on
    fn root(&self) -> &Path;

    /// Get the current branch name
    async fn current_branch(&self) -> Result<BranchName, GitError>;

    /// Resolve `HEAD` to a full commit hash
    async fn head_commit(&self) -> Result<CommitHash, GitError>;

    /// Get repository status
    async fn status(&self) -> Result<GitStatus, GitError>;

    /// Check if a branch exists locally
    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError>;

    /// Whether `<remote>/<branch>` is known locally as a remote-tracking ref
    async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, GitError>;

    /// Create `branch` from `base` and check it out
    async fn create_branch(&self, branch: &str, base: &str) -> Result<(), GitError>;

    /// Checkout a branch
    async fn checkout(&self, branch: &str) -> Result<(), GitError>;

    /// Delete a local branch
    async fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError>;

    /// Delete a branch on the remote
    async fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Stage paths; an empty slice stages the whole tree minus `excludes`
    async fn add(&self, paths: &[String], excludes: &[String]) -> Result<(), GitError>;

    /// Commit staged changes and return the new commit hash
    async fn commit(&self, message: &str) -> Result<CommitHash, GitError>;

    /// Drop staged changes for `paths`, leaving the working tree alone
    async fn unstage(&self, paths: &[String]) -> Result<(), GitError>;

    /// Push a branch to remote
    async fn push(&self, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Force-push guarded by a lease on the expected remote tip
    /// (`None` expects the remote branch to be absent)
    async fn push_with_lease(
        &self,
        remote: &str,
        branch: &str,
        expected: Option<&str>,
    ) -> Result<(), GitError>;

    /// Fetch from a remote, optionally a single branch
    async fn fetch(&self, remote: &str, branch: Option<&str>) -> Result<(), GitError>;

    /// The locally known tip of `remote/branch`
    async fn remote_ref(&self, remote: &str, branch: &str) -> Result<Option<CommitHash>, GitError>;

    /// Merge `rev` into the current branch with a merge commit
    async fn merge(&self, rev: &str, message: &str) -> Result<(), GitError>;

    async fn merge_abort(&self) -> Result<(), GitError>;

    /// Rebase the current branch onto `onto`
    async fn rebase(&self, onto: &str) -> Result<(), GitError>;

    async fn rebase_abort(&self) -> Result<(), GitError>;

    async fn reset(&self, mode: ResetMode, target: &str) -> Result<(), GitError>;

    /// Stash uncommitted changes including untracked files; returns whether
    /// anything was stashed
    async fn stash_push(&self, message: &str) -> Result<bool, GitError>;

    async fn stash_pop(&self) -> Result<(), GitError>;

    /// Remove untracked files and directories
    async fn clean_untracked(&self) -> Result<(), GitError>;

    /// Most recent commits reachable from `HEAD`, newest first
    async fn log(&self, max_count: usize) -> Result<Vec<CommitInfo>, GitError>;

    /// Whether `rev` names an existing commit
    async fn commit_exists(&self, rev: &str) -> Result<bool, GitError>;

    /// Committer timestamp of `rev`
    async fn commit_time(&self, rev: &str) -> Result<DateTime<Utc>, GitError>;

    /// Restore `path` from `rev` into both index and working tree
    async fn restore_file(&self, rev: &str, path: &str) -> Result<(), GitError>;

    /// Files that differ between two revisions
    async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, GitError>;

    /// URL of a configured remote
    async fn remote_url(&self, remote: &str) -> Result<String, GitError>;

    /// Raw stdout of an arbitrary read-only git invocation (log, diff, reflog...)
    async fn capture(&self, args: &[&str]) -> Result<String, GitError>;
}

/// Real Git implementation
pub struct GitClient {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    root: PathBuf,
}

impl GitClient {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            program: program.into(),
            root: root.into(),
        }
    }

    async fn execute_git_command(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.executor.execute(&self.program, args, &self.root).await?;

        if !output.success() {
            return Err(self.classify_git_error(output.status_code, &output.stderr, &output.stdout, args));
        }

        Ok(output.stdout.trim_end().to_string())
    }

    fn classify_git_error(&self, exit_code: i32, stderr: &str, stdout: &str, args: &[&str]) -> GitError {
        let command = format!("git {}", args.join(" "));
        // merge and rebase report conflicts on stdout
        let combined = format!("{stderr}\n{stdout}");

        if stderr.contains("not a git repository") {
            GitError::RepositoryNotFound
        } else if combined.contains("CONFLICT") || combined.contains("merge conflict") {
            GitError::Conflict {
                command,
                stderr: combined.trim().to_string(),
            }
        } else if args.first() == Some(&"push")
            && (stderr.contains("rejected")
                || stderr.contains("non-fast-forward")
                || stderr.contains("stale info")
                || stderr.contains("fetch first"))
        {
            GitError::PushRejected {
                command,
                stderr: stderr.trim().to_string(),
            }
        } else if args.first() == Some(&"checkout")
            && !args.contains(&"--")
            && (stderr.contains("did not match") || stderr.contains("not found"))
        {
            GitError::BranchNotFound {
                branch: args.last().unwrap_or(&"unknown").to_string(),
            }
        } else {
            GitError::GitCommandFailed {
                command,
                exit_code,
                stderr: stderr.trim().to_string(),
            }
        }
    }

    /// Succeeds with `true`, fails with `false` for git's "no" exit status.
    async fn probe(&self, args: &[&str]) -> Result<bool, GitError> {
        match self.execute_git_command(args).await {
            Ok(_) => Ok(true),
            Err(GitError::GitCommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn parse_status_output(output: &str) -> GitStatus {
        let mut staged_files = Vec::new();
        let mut unstaged_files = Vec::new();
        let mut untracked_files = Vec::new();

        for line in output.lines() {
            if line.len() < 4 {
                continue;
            }

            let mut status_chars = line.chars();
            let index = status_chars.next().unwrap_or(' ');
            let worktree = status_chars.next().unwrap_or(' ');
            let filename = line[3..].to_string();

            if index == '?' && worktree == '?' {
                untracked_files.push(filename);
                continue;
            }
            if matches!(index, 'A' | 'M' | 'D' | 'R' | 'C' | 'U') {
                staged_files.push(filename.clone());
            }
            if matches!(worktree, 'M' | 'D' | 'U') {
                unstaged_files.push(filename);
            }
        }

        let is_clean = staged_files.is_empty() && unstaged_files.is_empty() && untracked_files.is_empty();

        GitStatus {
            current_branch: None,
            is_clean,
            staged_files,
            unstaged_files,
            untracked_files,
        }
    }

    pub(crate) fn parse_log_output(output: &str) -> Result<Vec<CommitInfo>, GitError> {
        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split(FIELD_SEP).collect();
                if fields.len() < 4 {
                    return Err(GitError::Parse {
                        message: format!("unexpected log line '{line}'"),
                    });
                }
                let timestamp = fields[3].trim().parse::<i64>().map_err(|e| GitError::Parse {
                    message: format!("bad commit timestamp '{}': {e}", fields[3]),
                })?;
                Ok(CommitInfo {
                    id: fields[0].to_string(),
                    message: fields[1].to_string(),
                    author: fields[2].to_string(),
                    timestamp,
                })
            })
            .collect()
    }
}

#[async_trait]
impl GitRepository for GitClient {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn current_branch(&self) -> Result<BranchName, GitError> {
        // Try the newer command first
        if let Ok(branch) = self.execute_git_command(&["branch", "--show-current"]).await {
            if !branch.is_empty() {
                return Ok(branch);
            }
        }

        // Fallback to the older method
        let output = self.execute_git_command(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;

        if output == "HEAD" {
            return Err(GitError::GitCommandFailed {
                command: "git rev-parse --abbrev-ref HEAD".to_string(),
                exit_code: 0,
                stderr: "HEAD is detached".to_string(),
            });
        }

        Ok(output)
    }

    async fn head_commit(&self) -> Result<CommitHash, GitError> {
        self.execute_git_command(&["rev-parse", "HEAD"]).await
    }

    async fn status(&self) -> Result<GitStatus, GitError> {
        let status_output = self.execute_git_command(&["status", "--porcelain"]).await?;
        let current_branch = self.current_branch().await.ok();

        let mut status = Self::parse_status_output(&status_output);
        status.current_branch = current_branch;

        Ok(status)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{branch}");
        self.probe(&["show-ref", "--verify", "--quiet", &reference]).await
    }

    async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/remotes/{remote}/{branch}");
        self.probe(&["show-ref", "--verify", "--quiet", &reference]).await
    }

    async fn create_branch(&self, branch: &str, base: &str) -> Result<(), GitError> {
        self.execute_git_command(&["checkout", "-b", branch, base]).await?;
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.execute_git_command(&["checkout", branch]).await?;
        Ok(())
    }

    async fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.execute_git_command(&["branch", flag, branch]).await?;
        Ok(())
    }

    async fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.execute_git_command(&["push", remote, "--delete", branch]).await?;
        Ok(())
    }

    async fn add(&self, paths: &[String], excludes: &[String]) -> Result<(), GitError> {
        let mut args: Vec<String> = vec!["add".to_string()];
        if paths.is_empty() {
            args.push("-A".to_string());
            args.push("--".to_string());
            args.push(".".to_string());
            args.extend(excludes.iter().map(|e| format!(":(exclude){e}")));
        } else {
            args.push("--".to_string());
            args.extend(paths.iter().cloned());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.execute_git_command(&args).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitHash, GitError> {
        self.execute_git_command(&["commit", "-m", message]).await?;
        self.head_commit().await
    }

    async fn unstage(&self, paths: &[String]) -> Result<(), GitError> {
        let mut args = vec!["reset", "--quiet", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.execute_git_command(&args).await?;
        Ok(())
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.execute_git_command(&["push", "--set-upstream", remote, branch]).await?;
        Ok(())
    }

    async fn push_with_lease(
        &self,
        remote: &str,
        branch: &str,
        expected: Option<&str>,
    ) -> Result<(), GitError> {
        let lease = format!("--force-with-lease={}:{}", branch, expected.unwrap_or(""));
        self.execute_git_command(&["push", &lease, remote, branch]).await?;
        Ok(())
    }

    async fn fetch(&self, remote: &str, branch: Option<&str>) -> Result<(), GitError> {
        match branch {
            Some(branch) => self.execute_git_command(&["fetch", remote, branch]).await?,
            None => self.execute_git_command(&["fetch", remote]).await?,
        };
        Ok(())
    }

    async fn remote_ref(&self, remote: &str, branch: &str) -> Result<Option<CommitHash>, GitError> {
        let reference = format!("refs/remotes/{remote}/{branch}");
        match self.execute_git_command(&["rev-parse", "--verify", "--quiet", &reference]).await {
            Ok(sha) if !sha.is_empty() => Ok(Some(sha)),
            Ok(_) | Err(GitError::GitCommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn merge(&self, rev: &str, message: &str) -> Result<(), GitError> {
        self.execute_git_command(&["merge", "--no-ff", "--no-edit", "-m", message, rev]).await?;
        Ok(())
    }

    async fn merge_abort(&self) -> Result<(), GitError> {
        self.execute_git_command(&["merge", "--abort"]).await?;
        Ok(())
    }

    async fn rebase(&self, onto: &str) -> Result<(), GitError> {
        self.execute_git_command(&["rebase", onto]).await?;
        Ok(())
    }

    async fn rebase_abort(&self) -> Result<(), GitError> {
        self.execute_git_command(&["rebase", "--abort"]).await?;
        Ok(())
    }

    async fn reset(&self, mode: ResetMode, target: &str) -> Result<(), GitError> {
        self.execute_git_command(&["reset", mode.flag(), target]).await?;
        Ok(())
    }

    async fn stash_push(&self, message: &str) -> Result<bool, GitError> {
        let output = self
            .execute_git_command(&["stash", "push", "--include-untracked", "-m", message])
            .await?;
        Ok(!output.contains("No local changes to save"))
    }

    async fn stash_pop(&self) -> Result<(), GitError> {
        self.execute_git_command(&["stash", "pop"]).await?;
        Ok(())
    }

    async fn clean_untracked(&self) -> Result<(), GitError> {
        self.execute_git_command(&["clean", "-fd"]).await?;
        Ok(())
    }

    async fn log(&self, max_count: usize) -> Result<Vec<CommitInfo>, GitError> {
        let count = format!("--max-count={max_count}");
        let format = "--format=%H%x1f%s%x1f%an%x1f%ct";
        let output = self.execute_git_command(&["log", &count, format]).await?;
        Self::parse_log_output(&output)
    }

    async fn commit_exists(&self, rev: &str) -> Result<bool, GitError> {
        let object = format!("{rev}^{{commit}}");
        self.probe(&["cat-file", "-e", &object]).await
    }

    async fn commit_time(&self, rev: &str) -> Result<DateTime<Utc>, GitError> {
        let output = self.execute_git_command(&["show", "-s", "--format=%ct", rev]).await?;
        let seconds = output.trim().parse::<i64>().map_err(|e| GitError::Parse {
            message: format!("bad commit timestamp '{output}': {e}"),
        })?;
        Utc.timestamp_opt(seconds, 0).single().ok_or_else(|| GitError::Parse {
            message: format!("timestamp out of range: {seconds}"),
        })
    }

    async fn restore_file(&self, rev: &str, path: &str) -> Result<(), GitError> {
        self.execute_git_command(&["checkout", rev, "--", path]).await?;
        Ok(())
    }

    async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        let output = self.execute_git_command(&["diff", "--name-only", from, to]).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remote_url(&self, remote: &str) -> Result<String, GitError> {
        self.execute_git_command(&["remote", "get-url", remote]).await
    }

    async fn capture(&self, args: &[&str]) -> Result<String, GitError> {
        self.execute_git_command(args).await
    }
}
