//! Escalating push reconciliation.
//!
//! Strategies run in a fixed order and stop at the first success: plain push,
//! fetch + merge, rebase, then push with a lease bound to the fetched remote
//! tip. The forced update is only ever reached after the other three failed.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::execution::{EngineError, ExecutionResult};
use crate::external::{CommitHash, GitError, GitRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PushStrategy {
    DirectPush,
    FetchMerge,
    Rebase,
    ForceWithLease,
}

impl PushStrategy {
    pub const ESCALATION: [PushStrategy; 4] = [
        PushStrategy::DirectPush,
        PushStrategy::FetchMerge,
        PushStrategy::Rebase,
        PushStrategy::ForceWithLease,
    ];
}

impl fmt::Display for PushStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PushStrategy::DirectPush => "direct push",
            PushStrategy::FetchMerge => "fetch + merge",
            PushStrategy::Rebase => "rebase",
            PushStrategy::ForceWithLease => "force-with-lease",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: PushStrategy,
    pub succeeded: bool,
    /// Captured stderr of the step that failed
    pub stderr: Option<String>,
}

/// Everything the resolver tried, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionTrace {
    pub branch: String,
    pub remote: String,
    pub attempts: Vec<StrategyAttempt>,
    pub succeeded_with: Option<PushStrategy>,
}

impl ResolutionTrace {
    pub fn attempted(&self, strategy: PushStrategy) -> bool {
        self.attempts.iter().any(|a| a.strategy == strategy)
    }

    pub fn render(&self) -> String {
        self.attempts
            .iter()
            .enumerate()
            .map(|(i, a)| match (&a.stderr, a.succeeded) {
                (_, true) => format!("{}. {}: succeeded", i + 1, a.strategy),
                (Some(stderr), false) => format!("{}. {}: failed ({})", i + 1, a.strategy, stderr),
                (None, false) => format!("{}. {}: failed", i + 1, a.strategy),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn record(&mut self, strategy: PushStrategy, outcome: Result<(), GitError>) -> bool {
        let succeeded = outcome.is_ok();
        let stderr = outcome.err().map(|e| e.stderr());
        match &stderr {
            Some(stderr) => warn!(branch = %self.branch, %strategy, %stderr, "Push strategy failed"),
            None => info!(branch = %self.branch, %strategy, "Push strategy succeeded"),
        }
        self.attempts.push(StrategyAttempt {
            strategy,
            succeeded,
            stderr,
        });
        if succeeded {
            self.succeeded_with = Some(strategy);
        }
        succeeded
    }
}

pub struct ConflictResolver {
    config: Arc<EngineConfig>,
    git: Arc<dyn GitRepository>,
}

impl ConflictResolver {
    pub fn new(config: Arc<EngineConfig>, git: Arc<dyn GitRepository>) -> Self {
        Self { config, git }
    }

    pub async fn resolve_and_push(&self, branch: &str, remote: &str) -> ExecutionResult<ResolutionTrace> {
        let mut trace = ResolutionTrace {
            branch: branch.to_string(),
            remote: remote.to_string(),
            attempts: Vec::new(),
            succeeded_with: None,
        };
        let tracking = format!("{remote}/{branch}");
        // Lease token for the last resort; None means "branch must not exist remotely"
        let mut remote_tip: Option<CommitHash> = None;

        for strategy in PushStrategy::ESCALATION {
            let outcome = match strategy {
                PushStrategy::DirectPush => self.git.push(remote, branch).await,
                PushStrategy::FetchMerge => self.fetch_and_merge(remote, branch, &tracking, &mut remote_tip).await,
                PushStrategy::Rebase => self.rebase_and_push(remote, branch, &tracking, &mut remote_tip).await,
                PushStrategy::ForceWithLease => {
                    self.git.push_with_lease(remote, branch, remote_tip.as_deref()).await
                }
            };
            if trace.record(strategy, outcome) {
                return ExecutionResult::ok(format!("Pushed '{branch}' via {strategy}"), trace);
            }
        }

        let attempts = trace.attempts.len();
        ExecutionResult::failed_with(
            format!("All push strategies failed for '{branch}':\n{}", trace.render()),
            EngineError::Conflict {
                branch: branch.to_string(),
                attempts,
            },
            trace,
        )
    }

    async fn refresh_remote_tip(
        &self,
        remote: &str,
        branch: &str,
        remote_tip: &mut Option<CommitHash>,
    ) -> Result<CommitHash, GitError> {
        self.git.fetch(remote, Some(branch)).await?;
        let tip = self.git.remote_ref(remote, branch).await?;
        *remote_tip = tip.clone();
        tip.ok_or_else(|| GitError::BranchNotFound {
            branch: format!("{remote}/{branch}"),
        })
    }

    async fn fetch_and_merge(
        &self,
        remote: &str,
        branch: &str,
        tracking: &str,
        remote_tip: &mut Option<CommitHash>,
    ) -> Result<(), GitError> {
        self.refresh_remote_tip(remote, branch, remote_tip).await?;

        let message = format!("{} merge {tracking} into {branch}", self.config.patch.commit_prefix);
        if let Err(e) = self.git.merge(tracking, &message).await {
            if let Err(abort) = self.git.merge_abort().await {
                warn!(branch, error = %abort, "merge --abort failed");
            }
            return Err(e);
        }

        self.git.push(remote, branch).await
    }

    async fn rebase_and_push(
        &self,
        remote: &str,
        branch: &str,
        tracking: &str,
        remote_tip: &mut Option<CommitHash>,
    ) -> Result<(), GitError> {
        if remote_tip.is_none() {
            self.refresh_remote_tip(remote, branch, remote_tip).await?;
        }

        if let Err(e) = self.git.rebase(tracking).await {
            if let Err(abort) = self.git.rebase_abort().await {
                warn!(branch, error = %abort, "rebase --abort failed");
            }
            return Err(e);
        }

        self.git.push(remote, branch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{CommandOutput, GitClient, ScriptedCommandExecutor};

    const PUSH: &[&str] = &["push", "--set-upstream", "origin", "patch/fix"];

    fn resolver(executor: ScriptedCommandExecutor) -> (ConflictResolver, Arc<ScriptedCommandExecutor>) {
        let executor = Arc::new(executor);
        let git = Arc::new(GitClient::new(executor.clone(), "git", "/repo"));
        (ConflictResolver::new(Arc::new(EngineConfig::default()), git), executor)
    }

    fn rejected() -> CommandOutput {
        CommandOutput::failed(1, "! [rejected] patch/fix -> patch/fix (fetch first)")
    }

    #[tokio::test]
    async fn test_direct_push_succeeds_first() {
        let (resolver, executor) = resolver(ScriptedCommandExecutor::new().expect_command("git", PUSH, CommandOutput::ok("")));

        let result = resolver.resolve_and_push("patch/fix", "origin").await;

        assert!(result.is_success());
        let trace = result.data().unwrap();
        assert_eq!(trace.attempts.len(), 1);
        assert_eq!(trace.succeeded_with, Some(PushStrategy::DirectPush));
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_diverged_remote_resolved_by_merge() {
        let (resolver, executor) = resolver(
            ScriptedCommandExecutor::permissive()
                .expect_command("git", PUSH, rejected())
                .expect_command("git", PUSH, CommandOutput::ok(""))
                .expect_command(
                    "git",
                    &["rev-parse", "--verify", "--quiet", "refs/remotes/origin/patch/fix"],
                    CommandOutput::ok("1111111"),
                ),
        );

        let result = resolver.resolve_and_push("patch/fix", "origin").await;

        assert!(result.is_success());
        let trace = result.data().unwrap();
        assert!(!trace.attempts[0].succeeded);
        assert!(trace.attempts[0].stderr.as_ref().unwrap().contains("rejected"));
        assert_eq!(trace.succeeded_with, Some(PushStrategy::FetchMerge));
        assert!(!trace.attempted(PushStrategy::Rebase));
        assert!(!trace.attempted(PushStrategy::ForceWithLease));
        assert_eq!(executor.count_of("git rebase"), 0);
        assert!(executor.position_of("git fetch origin patch/fix") < executor.position_of("git merge --no-ff"));
    }

    #[tokio::test]
    async fn test_merge_conflict_is_aborted_then_rebase_tried() {
        let (resolver, executor) = resolver(
            ScriptedCommandExecutor::permissive()
                .expect_command("git", PUSH, rejected())
                .expect_command("git", PUSH, CommandOutput::ok(""))
                .expect_command(
                    "git",
                    &["rev-parse", "--verify", "--quiet", "refs/remotes/origin/patch/fix"],
                    CommandOutput::ok("1111111"),
                )
                .expect_prefix(
                    "git merge --no-ff",
                    CommandOutput {
                        status_code: 1,
                        stdout: "CONFLICT (content): Merge conflict in readme.txt".to_string(),
                        stderr: String::new(),
                    },
                ),
        );

        let result = resolver.resolve_and_push("patch/fix", "origin").await;

        assert!(result.is_success());
        assert_eq!(result.data().unwrap().succeeded_with, Some(PushStrategy::Rebase));
        assert_eq!(executor.count_of("git merge --abort"), 1);
        assert!(executor.position_of("git merge --abort") < executor.position_of("git rebase origin/patch/fix"));
    }

    #[tokio::test]
    async fn test_all_strategies_exhausted_reports_conflict_with_trace() {
        let conflict = CommandOutput::failed(1, "CONFLICT (content): Merge conflict in readme.txt");
        let (resolver, executor) = resolver(
            ScriptedCommandExecutor::permissive()
                .expect_command("git", PUSH, rejected())
                .expect_command(
                    "git",
                    &["rev-parse", "--verify", "--quiet", "refs/remotes/origin/patch/fix"],
                    CommandOutput::ok("1111111"),
                )
                .expect_prefix("git merge --no-ff", conflict.clone())
                .expect_command("git", &["rebase", "origin/patch/fix"], conflict)
                .expect_prefix(
                    "git push --force-with-lease",
                    CommandOutput::failed(1, "! [rejected] patch/fix (stale info)"),
                ),
        );

        let result = resolver.resolve_and_push("patch/fix", "origin").await;

        assert!(!result.is_success());
        assert_eq!(
            result.error,
            Some(EngineError::Conflict {
                branch: "patch/fix".to_string(),
                attempts: 4
            })
        );
        let trace = result.data().unwrap();
        assert_eq!(
            trace.attempts.iter().map(|a| a.strategy).collect::<Vec<_>>(),
            PushStrategy::ESCALATION.to_vec()
        );
        assert!(trace.attempts.iter().all(|a| !a.succeeded && a.stderr.is_some()));
        assert_eq!(executor.count_of("git push --force-with-lease=patch/fix:1111111 origin patch/fix"), 1);
        assert!(result.message.contains("4. force-with-lease: failed"));
    }
}
