//! Background monitoring of an open review
//!
//! Two loops run concurrently per review: one applies bot-suggested edits to
//! the patch branch, the other watches merge status and resolves the linked
//! ticket. Both share one [`ReviewTracker`] and stop on their time budget,
//! on cancellation, or once the review reaches a terminal state.

pub mod state;
pub mod suggestions;
pub mod tickets;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::EngineConfig;
use crate::execution::EngineError;
use crate::external::{CommitHash, ReviewComment, ReviewId, TicketId, Toolchain};
use crate::lock::WorkingTreeLock;
use crate::telemetry::{create_monitor_span, generate_correlation_id};

pub use state::{ReviewEvent, ReviewStatus, ReviewTracker};
pub use suggestions::{apply_suggestion, default_parsers, is_bot, Suggestion, SuggestionParser};
pub use tickets::TicketReport;

/// Identifiers a monitor is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub review_id: ReviewId,
    pub branch: String,
    pub linked_ticket: Option<TicketId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSuggestion {
    pub comment_id: u64,
    pub reason: String,
}

/// Result of applying one batch of new suggestions
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub applied: Vec<u64>,
    pub failed: Vec<FailedSuggestion>,
    pub commit: Option<CommitHash>,
    pub push_error: Option<String>,
}

impl BatchReport {
    fn summary(&self, review_id: ReviewId) -> String {
        let mut out = format!(
            "Applied {} of {} suggestion(s) on review #{review_id}.",
            self.applied.len(),
            self.applied.len() + self.failed.len()
        );
        if let Some(commit) = &self.commit {
            out.push_str(&format!("\n\nCommit: `{commit}`"));
        }
        for failed in &self.failed {
            out.push_str(&format!("\n- comment {} not applied: {}", failed.comment_id, failed.reason));
        }
        if let Some(err) = &self.push_error {
            out.push_str(&format!("\n\nPush failed: {err}"));
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuggestionReport {
    pub batches: Vec<BatchReport>,
    pub errors: Vec<String>,
    pub budget_exhausted: bool,
    pub cancelled: bool,
}

impl SuggestionReport {
    pub fn applied(&self) -> usize {
        self.batches.iter().map(|b| b.applied.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub review_id: ReviewId,
    pub status: ReviewStatus,
    pub suggestions: SuggestionReport,
    pub tickets: TicketReport,
}

impl MonitorReport {
    pub fn final_status(&self) -> ReviewStatus {
        self.status
    }
}

pub struct ReviewMonitor {
    config: Arc<EngineConfig>,
    tools: Toolchain,
    lock: WorkingTreeLock,
    parsers: Vec<Box<dyn SuggestionParser>>,
}

impl ReviewMonitor {
    pub fn new(config: Arc<EngineConfig>, tools: Toolchain) -> Self {
        let lock = WorkingTreeLock::for_root(&config.repository.root);
        Self {
            config,
            tools,
            lock,
            parsers: default_parsers(),
        }
    }

    /// Run both loops to completion
    pub async fn run(&self, target: MonitorTarget, cancel: CancellationToken) -> MonitorReport {
        let span = create_monitor_span(
            target.review_id,
            &target.branch,
            target.linked_ticket,
            &generate_correlation_id(),
        );

        async {
            info!("Review monitoring started");
            let tracker = Mutex::new(ReviewTracker::new(
                target.review_id,
                target.linked_ticket,
                target.branch.clone(),
            ));

            let (suggestions, tickets) = tokio::join!(
                self.watch_suggestions(&target, &tracker, &cancel),
                self.watch_status(&target, &tracker, &cancel),
            );

            let status = tracker.lock().await.status();
            MonitorReport {
                review_id: target.review_id,
                status,
                suggestions,
                tickets,
            }
        }
        .instrument(span)
        .await
    }

    async fn watch_suggestions(
        &self,
        target: &MonitorTarget,
        tracker: &Mutex<ReviewTracker>,
        cancel: &CancellationToken,
    ) -> SuggestionReport {
        let deadline = Instant::now() + self.config.suggestion_budget();
        let mut report = SuggestionReport::default();

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if tracker.lock().await.is_terminal() {
                break;
            }
            if Instant::now() >= deadline {
                debug!("Suggestion budget exhausted");
                report.budget_exhausted = true;
                break;
            }

            match self.poll_suggestions(target, tracker).await {
                Ok(Some(batch)) => report.batches.push(batch),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Suggestion poll failed; retrying next interval");
                    report.errors.push(e.to_string());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        report
    }

    /// One poll: fetch comments, apply the new bot suggestions as one commit
    ///
    /// Returns `None` when nothing new arrived.
    pub async fn poll_suggestions(
        &self,
        target: &MonitorTarget,
        tracker: &Mutex<ReviewTracker>,
    ) -> Result<Option<BatchReport>, EngineError> {
        let comments = self.tools.review.review_comments(target.review_id).await?;
        let candidates: Vec<ReviewComment> = comments
            .into_iter()
            .filter(|c| is_bot(&c.author, &self.config.monitor.bot_authors))
            .collect();

        let fresh: Vec<ReviewComment> = {
            let tracker = tracker.lock().await;
            candidates.into_iter().filter(|c| !tracker.has_seen(c.id)).collect()
        };
        if fresh.is_empty() {
            return Ok(None);
        }

        tracker.lock().await.handle(ReviewEvent::SuggestionsFound { count: fresh.len() });
        let batch = self
            .lock
            .run_exclusive(self.config.lock_timeout(), || self.apply_batch(target, &fresh))
            .await
            .and_then(|batch| batch);

        // Ids count as seen only once their batch went through; anything else
        // is picked up again on the next poll
        let mut tracker = tracker.lock().await;
        tracker.handle(ReviewEvent::SuggestionsApplied);
        let batch = batch?;
        tracker.mark_seen(fresh.iter().map(|c| c.id));
        drop(tracker);

        info!(
            applied = batch.applied.len(),
            failed = batch.failed.len(),
            commit = ?batch.commit,
            "Suggestion batch processed"
        );
        if let Err(e) = self
            .tools
            .review
            .comment_review(target.review_id, &batch.summary(target.review_id))
            .await
        {
            warn!(error = %e, "Could not post suggestion summary");
        }

        Ok(Some(batch))
    }

    fn parse(&self, comment: &ReviewComment) -> Option<Suggestion> {
        self.parsers.iter().find_map(|parser| {
            let parsed = parser.parse(comment);
            if parsed.is_some() {
                debug!(comment = comment.id, parser = parser.name(), "Suggestion parsed");
            }
            parsed
        })
    }

    async fn apply_batch(&self, target: &MonitorTarget, comments: &[ReviewComment]) -> Result<BatchReport, EngineError> {
        let git = &self.tools.git;
        let root = &self.config.repository.root;

        if git.current_branch().await.ok().as_deref() != Some(target.branch.as_str()) {
            git.checkout(&target.branch).await?;
        }

        let mut report = BatchReport::default();
        // path -> contents before this batch touched it
        let mut touched: BTreeMap<String, String> = BTreeMap::new();
        for comment in comments {
            let Some(suggestion) = self.parse(comment) else {
                report.failed.push(FailedSuggestion {
                    comment_id: comment.id,
                    reason: "no recognisable suggestion".to_string(),
                });
                continue;
            };

            match apply_suggestion(root, &suggestion).await {
                Ok(original) => match self.check_syntax(&suggestion.path).await {
                    Ok(()) => {
                        report.applied.push(comment.id);
                        touched.entry(suggestion.path.clone()).or_insert(original);
                    }
                    Err(reason) => {
                        if let Err(e) = tokio::fs::write(root.join(&suggestion.path), original).await {
                            warn!(path = %suggestion.path, error = %e, "Could not revert rejected suggestion");
                        }
                        report.failed.push(FailedSuggestion {
                            comment_id: comment.id,
                            reason,
                        });
                    }
                },
                Err(e) => report.failed.push(FailedSuggestion {
                    comment_id: comment.id,
                    reason: e.to_string(),
                }),
            }
        }

        if touched.is_empty() {
            return Ok(report);
        }

        let paths: Vec<String> = touched.keys().cloned().collect();
        let message = format!(
            "{} apply {} review suggestion(s) from #{}",
            self.config.patch.commit_prefix,
            report.applied.len(),
            target.review_id
        );
        let committed = match git.add(&paths, &[]).await {
            Ok(()) => git.commit(&message).await,
            Err(e) => Err(e),
        };
        match committed {
            Ok(commit) => report.commit = Some(commit),
            Err(e) => {
                self.revert_batch(&touched).await;
                return Err(e.into());
            }
        }

        if let Err(e) = git.push(&self.config.repository.remote, &target.branch).await {
            warn!(error = %e, "Suggestion commit not pushed");
            report.push_error = Some(e.to_string());
        }

        Ok(report)
    }

    /// Put every file of a failed batch back the way it was
    async fn revert_batch(&self, touched: &BTreeMap<String, String>) {
        let root = &self.config.repository.root;
        let paths: Vec<String> = touched.keys().cloned().collect();
        if let Err(e) = self.tools.git.unstage(&paths).await {
            warn!(error = %e, "Could not unstage suggestion batch");
        }
        for (path, original) in touched {
            if let Err(e) = tokio::fs::write(root.join(path), original).await {
                warn!(path = %path, error = %e, "Could not revert suggestion");
            }
        }
    }

    async fn check_syntax(&self, path: &str) -> Result<(), String> {
        let Some(command) = &self.config.monitor.syntax_check_command else {
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };

        let args: Vec<String> = args.iter().map(|a| a.replace("{file}", path)).collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self
            .tools
            .executor
            .execute(program, &args, &self.config.repository.root)
            .await
        {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(format!("syntax check failed: {}", output.stderr.trim())),
            Err(e) => Err(format!("syntax check could not run: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::github::MockReviewOperations;
    use crate::external::{CommandOutput, GitClient, RemoteReviewState, ReviewSnapshot, ScriptedCommandExecutor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const BRANCH: &str = "patch/20261018-090507-fix-typo";

    fn target(ticket: Option<TicketId>) -> MonitorTarget {
        MonitorTarget {
            review_id: 42,
            branch: BRANCH.to_string(),
            linked_ticket: ticket,
        }
    }

    fn executor() -> Arc<ScriptedCommandExecutor> {
        Arc::new(
            ScriptedCommandExecutor::permissive()
                .expect_command("git", &["branch", "--show-current"], CommandOutput::ok(BRANCH))
                .expect_command("git", &["rev-parse", "HEAD"], CommandOutput::ok("feed123")),
        )
    }

    fn monitor(dir: &TempDir, executor: Arc<ScriptedCommandExecutor>, review: MockReviewOperations) -> ReviewMonitor {
        let config = Arc::new(EngineConfig::default().with_root(dir.path()));
        let git = Arc::new(GitClient::new(executor.clone(), "git", dir.path()));
        ReviewMonitor::new(config, Toolchain::new(executor, git, Arc::new(review)))
    }

    fn snapshot(state: RemoteReviewState) -> ReviewSnapshot {
        ReviewSnapshot {
            id: 42,
            state,
            labels: vec![],
            head_branch: BRANCH.to_string(),
            url: "https://github.com/acme/site/pull/42".to_string(),
        }
    }

    fn bot_comment(id: u64, body: &str) -> ReviewComment {
        ReviewComment {
            id,
            author: "review-bot[bot]".to_string(),
            body: body.to_string(),
            path: Some("readme.txt".to_string()),
            line: Some(2),
            start_line: None,
            diff_hunk: Some("@@ -1,2 +1,2 @@\n hello\n-wrold\n+wrold".to_string()),
        }
    }

    #[tokio::test]
    async fn test_one_valid_and_one_unparseable_suggestion_make_one_commit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello\nwrold\n").unwrap();

        let mut review = MockReviewOperations::new();
        review.expect_review_comments().returning(|_| {
            Ok(vec![
                bot_comment(1, "Typo:\n```suggestion\nworld\n```"),
                bot_comment(2, "This whole section feels off."),
                ReviewComment {
                    id: 3,
                    author: "alice".to_string(),
                    body: "```suggestion\nignored\n```".to_string(),
                    ..bot_comment(3, "")
                },
            ])
        });
        review.expect_comment_review().times(1).returning(|_, _| Ok(()));

        let executor = executor();
        let monitor = monitor(&dir, executor.clone(), review);
        let tracker = Mutex::new(ReviewTracker::new(42, None, BRANCH));

        let batch = monitor.poll_suggestions(&target(None), &tracker).await.unwrap().unwrap();

        assert_eq!(batch.applied, vec![1]);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].comment_id, 2);
        assert_eq!(batch.commit.as_deref(), Some("feed123"));
        assert_eq!(executor.count_of("git commit"), 1);
        assert!(executor.position_of("git add -- readme.txt").is_some());
        assert_eq!(std::fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "hello\nworld\n");
        assert_eq!(tracker.lock().await.status(), ReviewStatus::Open);
    }

    #[tokio::test]
    async fn test_seen_suggestions_are_not_reapplied() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello\nwrold\n").unwrap();

        let mut review = MockReviewOperations::new();
        review
            .expect_review_comments()
            .returning(|_| Ok(vec![bot_comment(1, "```suggestion\nworld\n```")]));
        review.expect_comment_review().times(1).returning(|_, _| Ok(()));

        let executor = executor();
        let monitor = monitor(&dir, executor.clone(), review);
        let tracker = Mutex::new(ReviewTracker::new(42, None, BRANCH));

        assert!(monitor.poll_suggestions(&target(None), &tracker).await.unwrap().is_some());
        assert!(monitor.poll_suggestions(&target(None), &tracker).await.unwrap().is_none());
        assert_eq!(executor.count_of("git commit"), 1);
    }

    #[tokio::test]
    async fn test_failed_syntax_check_reverts_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello\nwrold\n").unwrap();

        let mut config = EngineConfig::default().with_root(dir.path());
        config.monitor.syntax_check_command = Some(vec!["lint".to_string(), "{file}".to_string()]);
        let executor = Arc::new(
            ScriptedCommandExecutor::permissive()
                .expect_command("git", &["branch", "--show-current"], CommandOutput::ok(BRANCH))
                .expect_command("lint", &["readme.txt"], CommandOutput::failed(1, "unexpected token")),
        );
        let mut review = MockReviewOperations::new();
        review
            .expect_review_comments()
            .returning(|_| Ok(vec![bot_comment(1, "```suggestion\nworld\n```")]));
        review.expect_comment_review().returning(|_, _| Ok(()));
        let git = Arc::new(GitClient::new(executor.clone(), "git", dir.path()));
        let monitor = ReviewMonitor::new(Arc::new(config), Toolchain::new(executor.clone(), git, Arc::new(review)));
        let tracker = Mutex::new(ReviewTracker::new(42, None, BRANCH));

        let batch = monitor.poll_suggestions(&target(None), &tracker).await.unwrap().unwrap();

        assert!(batch.applied.is_empty());
        assert!(batch.failed[0].reason.contains("unexpected token"));
        assert!(batch.commit.is_none());
        assert_eq!(executor.count_of("git commit"), 0);
        assert_eq!(std::fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "hello\nwrold\n");
    }

    #[tokio::test]
    async fn test_busy_working_tree_leaves_suggestions_for_next_poll() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello\nwrold\n").unwrap();

        let mut review = MockReviewOperations::new();
        review
            .expect_review_comments()
            .returning(|_| Ok(vec![bot_comment(1, "```suggestion\nworld\n```")]));
        review.expect_comment_review().times(1).returning(|_, _| Ok(()));

        let executor = executor();
        let mut config = EngineConfig::default().with_root(dir.path());
        config.patch.lock_timeout_secs = 0;
        let git = Arc::new(GitClient::new(executor.clone(), "git", dir.path()));
        let monitor = ReviewMonitor::new(Arc::new(config), Toolchain::new(executor.clone(), git, Arc::new(review)));
        let tracker = Mutex::new(ReviewTracker::new(42, None, BRANCH));
        let target = target(None);

        let held = WorkingTreeLock::for_root(dir.path());
        let busy = held
            .run_exclusive(std::time::Duration::from_secs(5), || monitor.poll_suggestions(&target, &tracker))
            .await
            .unwrap();

        assert_eq!(busy.unwrap_err().kind(), "ValidationError");
        assert!(!tracker.lock().await.has_seen(1));
        assert_eq!(tracker.lock().await.status(), ReviewStatus::Open);
        assert_eq!(std::fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "hello\nwrold\n");

        let batch = monitor.poll_suggestions(&target, &tracker).await.unwrap().unwrap();

        assert_eq!(batch.applied, vec![1]);
        assert_eq!(executor.count_of("git commit"), 1);
        assert!(tracker.lock().await.has_seen(1));
        assert_eq!(std::fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "hello\nworld\n");
    }

    #[tokio::test]
    async fn test_rejected_commit_reverts_batch_and_retries_later() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello\nwrold\n").unwrap();

        let mut review = MockReviewOperations::new();
        review
            .expect_review_comments()
            .returning(|_| Ok(vec![bot_comment(1, "```suggestion\nworld\n```")]));
        review.expect_comment_review().never();

        let executor = Arc::new(
            ScriptedCommandExecutor::permissive()
                .expect_command("git", &["branch", "--show-current"], CommandOutput::ok(BRANCH))
                .expect_prefix("git commit", CommandOutput::failed(1, "pre-commit hook rejected the change")),
        );
        let monitor = monitor(&dir, executor.clone(), review);
        let tracker = Mutex::new(ReviewTracker::new(42, None, BRANCH));

        let result = monitor.poll_suggestions(&target(None), &tracker).await;

        assert_eq!(result.unwrap_err().kind(), "ProcessError");
        assert_eq!(std::fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "hello\nwrold\n");
        assert!(executor.position_of("git reset --quiet -- readme.txt") > executor.position_of("git commit"));
        assert!(!tracker.lock().await.has_seen(1));
        assert_eq!(tracker.lock().await.status(), ReviewStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_closes_ticket_and_stops_both_loops() {
        let dir = TempDir::new().unwrap();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();

        let mut review = MockReviewOperations::new();
        review.expect_review_comments().returning(|_| Ok(vec![]));
        review.expect_view_review().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(snapshot(if n < 2 { RemoteReviewState::Open } else { RemoteReviewState::Merged }))
        });
        review.expect_comment_ticket().times(1).returning(|_, _| Ok(()));
        review.expect_close_ticket().times(1).returning(|_| Ok(()));

        let executor = executor();
        let monitor = monitor(&dir, executor.clone(), review);

        let report = monitor.run(target(Some(7)), CancellationToken::new()).await;

        assert_eq!(report.final_status(), ReviewStatus::Merged);
        assert!(report.tickets.ticket_closed);
        assert!(report.tickets.branch_deleted);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(executor.position_of(&format!("git push origin --delete {BRANCH}")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_without_merge_leaves_ticket_open() {
        let dir = TempDir::new().unwrap();

        let mut review = MockReviewOperations::new();
        review.expect_review_comments().returning(|_| Ok(vec![]));
        review
            .expect_view_review()
            .returning(|_| Ok(snapshot(RemoteReviewState::Closed)));
        review.expect_comment_ticket().never();
        review.expect_close_ticket().never();

        let monitor = monitor(&dir, executor(), review);

        let report = monitor.run(target(Some(7)), CancellationToken::new()).await;

        assert_eq!(report.final_status(), ReviewStatus::ClosedUnmerged);
        assert!(!report.tickets.ticket_closed);
        assert!(!report.tickets.branch_deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_times_out_and_retries_failed_polls() {
        let dir = TempDir::new().unwrap();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();

        let mut review = MockReviewOperations::new();
        review.expect_review_comments().returning(|_| Ok(vec![]));
        review.expect_view_review().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(crate::external::ReviewError::RateLimitExceeded)
            } else {
                Ok(snapshot(RemoteReviewState::Open))
            }
        });
        review.expect_close_ticket().never();

        let executor = executor();
        let dir_root = dir.path().to_path_buf();
        let mut config = EngineConfig::default().with_root(&dir_root);
        config.monitor.poll_interval_secs = 60;
        config.monitor.suggestion_budget_secs = 120;
        config.monitor.ticket_budget_secs = 300;
        let git = Arc::new(GitClient::new(executor.clone(), "git", &dir_root));
        let monitor = ReviewMonitor::new(Arc::new(config), Toolchain::new(executor, git, Arc::new(review)));

        let report = monitor.run(target(Some(7)), CancellationToken::new()).await;

        assert_eq!(report.final_status(), ReviewStatus::TimedOut);
        assert!(report.suggestions.budget_exhausted);
        assert_eq!(report.tickets.poll_errors, 1);
        // polls at 0, 60, 120, 180, 240 seconds
        assert_eq!(polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_monitoring_without_terminal_state() {
        let dir = TempDir::new().unwrap();

        let mut review = MockReviewOperations::new();
        review.expect_review_comments().returning(|_| Ok(vec![]));
        review
            .expect_view_review()
            .returning(|_| Ok(snapshot(RemoteReviewState::Open)));
        review.expect_close_ticket().never();

        let monitor = monitor(&dir, executor(), review);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(150)).await;
            canceller.cancel();
        });

        let report = monitor.run(target(Some(7)), token).await;

        assert_eq!(report.final_status(), ReviewStatus::Open);
        assert!(report.suggestions.cancelled);
        assert!(report.tickets.cancelled);
    }
}
