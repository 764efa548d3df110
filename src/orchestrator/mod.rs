//! Patch workflow orchestration.
//!
//! `Init → Preflight → BranchCreate → ApplyOperation → Validate → Commit →
//! PushAndResolve → [OpenReview] → [StartMonitor] → Done`, strictly in order.
//! A failure after the branch exists runs `Compensate`, except a failed push:
//! that branch is kept so it can be pushed by hand.

pub mod branch;
pub mod review_body;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, ResolutionTrace};
use crate::execution::{EngineError, ExecutionResult};
use crate::external::{CommandExecutor, CommitHash, ReviewId, ReviewRequestConfig, TicketId, Toolchain};
use crate::lock::WorkingTreeLock;
use crate::monitor::{MonitorTarget, ReviewMonitor};
use crate::rollback::{RollbackEngine, RollbackParams, RollbackTarget};
use crate::safety::SafetyGate;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::{create_patch_span, generate_correlation_id};

use self::branch::unique_branch_name;
use self::review_body::{workflow_steps, ReviewBody, ValidationState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchFlags {
    pub force: bool,
    pub skip_validation: bool,
    pub create_review: bool,
    pub auto_merge: bool,
    pub dry_run: bool,
    pub install_missing: bool,
    /// Open a tracking ticket when none is linked
    pub create_ticket: bool,
}

#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub description: String,
    /// Files to stage; empty stages the whole tree
    pub files: Vec<String>,
    pub base_branch: Option<String>,
    pub flags: PatchFlags,
    pub linked_ticket: Option<TicketId>,
    /// Start review monitoring once the review is open
    pub monitor: bool,
}

impl PatchRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            files: Vec::new(),
            base_branch: None,
            flags: PatchFlags {
                create_review: true,
                ..PatchFlags::default()
            },
            linked_ticket: None,
            monitor: false,
        }
    }
}

/// The change a patch applies to the working tree
#[async_trait]
pub trait PatchOperation: Send + Sync {
    fn describe(&self) -> String;

    async fn apply(&self, root: &Path) -> Result<(), EngineError>;
}

/// Runs an external command in the project root
pub struct CommandOperation {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    args: Vec<String>,
}

impl CommandOperation {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executor,
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PatchOperation for CommandOperation {
    fn describe(&self) -> String {
        format!("{} {}", self.program, self.args.join(" ")).trim().to_string()
    }

    async fn apply(&self, root: &Path) -> Result<(), EngineError> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let output = self.executor.execute(&self.program, &args, root).await?;
        if !output.success() {
            return Err(EngineError::Process {
                command: self.describe(),
                exit_code: output.status_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}

/// Writes a file relative to the project root
pub struct WriteFileOperation {
    path: PathBuf,
    contents: String,
}

impl WriteFileOperation {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

#[async_trait]
impl PatchOperation for WriteFileOperation {
    fn describe(&self) -> String {
        format!("write {}", self.path.display())
    }

    async fn apply(&self, root: &Path) -> Result<(), EngineError> {
        let target = root.join(&self.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::validation(format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&target, &self.contents)
            .await
            .map_err(|e| EngineError::validation(format!("cannot write {}: {e}", target.display())))
    }
}

/// The change is already in the working tree
pub struct ExistingChanges;

#[async_trait]
impl PatchOperation for ExistingChanges {
    fn describe(&self) -> String {
        "commit existing working-tree changes".to_string()
    }

    async fn apply(&self, _root: &Path) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PatchStage {
    Init,
    Preflight,
    BranchCreate,
    ApplyOperation,
    Validate,
    Commit,
    PushAndResolve,
    OpenReview,
    StartMonitor,
    Done,
    Compensate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: PatchStage,
    pub success: bool,
    /// Logged only; dry runs never mutate
    pub simulated: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompensationReport {
    pub rollback_success: bool,
    pub rollback_message: Option<String>,
    pub checked_out: Option<String>,
    pub branch_deleted: bool,
    pub remote_branch_deleted: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchOutcome {
    pub branch: Option<String>,
    pub base_branch: String,
    pub original_branch: Option<String>,
    pub commit: Option<CommitHash>,
    pub review_id: Option<ReviewId>,
    pub review_url: Option<String>,
    pub linked_ticket: Option<TicketId>,
    pub resolution: Option<ResolutionTrace>,
    pub stages: Vec<StageRecord>,
    pub monitor_started: bool,
    pub compensation: Option<CompensationReport>,
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

impl PatchOutcome {
    pub fn reached(&self, stage: PatchStage) -> bool {
        self.stages.iter().any(|s| s.stage == stage && s.success)
    }
}

struct StageFailure {
    stage: PatchStage,
    error: EngineError,
}

impl StageFailure {
    fn at(stage: PatchStage) -> impl FnOnce(EngineError) -> StageFailure {
        move |error| StageFailure { stage, error }
    }
}

/// Mutable state of one attempt
struct PatchRun {
    outcome: PatchOutcome,
    dry_run: bool,
    branch_created: bool,
    branch_start: Option<CommitHash>,
    pushed: bool,
}

impl PatchRun {
    fn record(&mut self, stage: PatchStage, success: bool, detail: impl Into<String>) {
        let detail = detail.into();
        if success {
            info!(?stage, %detail, "Stage completed");
        } else {
            error!(?stage, %detail, "Stage failed");
        }
        self.outcome.stages.push(StageRecord {
            stage,
            success,
            simulated: false,
            detail,
        });
    }

    fn simulate(&mut self, stage: PatchStage, detail: impl Into<String>) {
        let detail = detail.into();
        info!(?stage, %detail, "[dry-run] Would run stage");
        self.outcome.stages.push(StageRecord {
            stage,
            success: true,
            simulated: true,
            detail,
        });
    }
}

pub struct PatchOrchestrator {
    config: Arc<EngineConfig>,
    tools: Toolchain,
    safety: SafetyGate,
    resolver: ConflictResolver,
    rollback: RollbackEngine,
    lock: WorkingTreeLock,
    shutdown: ShutdownCoordinator,
}

impl PatchOrchestrator {
    pub fn new(config: Arc<EngineConfig>, tools: Toolchain) -> Self {
        Self {
            safety: SafetyGate::new(config.clone(), tools.clone()),
            resolver: ConflictResolver::new(config.clone(), tools.git.clone()),
            rollback: RollbackEngine::new(config.clone(), tools.clone()),
            lock: WorkingTreeLock::for_root(&config.repository.root),
            shutdown: ShutdownCoordinator::new(),
            config,
            tools,
        }
    }

    /// Spawn monitors under a caller-owned coordinator
    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub async fn execute(&self, request: PatchRequest, operation: &dyn PatchOperation) -> ExecutionResult<PatchOutcome> {
        let correlation_id = generate_correlation_id();
        let span = create_patch_span(&request.description, &correlation_id);
        self.execute_inner(request, operation).instrument(span).await
    }

    async fn execute_inner(&self, request: PatchRequest, operation: &dyn PatchOperation) -> ExecutionResult<PatchOutcome> {
        let mut run = PatchRun {
            outcome: PatchOutcome {
                base_branch: request
                    .base_branch
                    .clone()
                    .unwrap_or_else(|| self.config.repository.default_base_branch.clone()),
                linked_ticket: request.linked_ticket,
                dry_run: request.flags.dry_run,
                ..PatchOutcome::default()
            },
            dry_run: request.flags.dry_run,
            branch_created: false,
            branch_start: None,
            pushed: false,
        };
        run.record(PatchStage::Init, true, format!("operation: {}", operation.describe()));

        let locked = self
            .lock
            .run_exclusive(self.config.lock_timeout(), || self.run_locked(&request, operation, &mut run))
            .await;

        match locked {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let message = format!("Patch '{}' failed: {error}", request.description);
                return ExecutionResult::failed_with(message, error, run.outcome);
            }
            Err(busy) => {
                run.record(PatchStage::Preflight, false, busy.to_string());
                return ExecutionResult::failed_with("Working tree is in use", busy, run.outcome);
            }
        }

        if request.monitor {
            match (run.dry_run, run.outcome.review_id, run.outcome.branch.clone()) {
                (true, _, _) => run.simulate(PatchStage::StartMonitor, "would start review monitors"),
                (false, Some(review_id), Some(branch)) => {
                    self.start_monitor(MonitorTarget {
                        review_id,
                        branch,
                        linked_ticket: run.outcome.linked_ticket,
                    });
                    run.outcome.monitor_started = true;
                    run.record(PatchStage::StartMonitor, true, format!("monitoring review #{review_id}"));
                }
                (false, _, _) => run
                    .outcome
                    .warnings
                    .push("monitoring requested but no review was opened".to_string()),
            }
        }

        run.record(PatchStage::Done, true, "patch workflow complete");
        let message = match (&run.outcome.branch, run.outcome.review_id) {
            (Some(branch), Some(id)) => format!("Patch applied on '{branch}', review #{id} opened"),
            (Some(branch), None) => format!("Patch applied on '{branch}'"),
            _ => "Patch workflow complete".to_string(),
        };
        ExecutionResult::ok(message, run.outcome)
    }

    async fn run_locked(
        &self,
        request: &PatchRequest,
        operation: &dyn PatchOperation,
        run: &mut PatchRun,
    ) -> Result<(), EngineError> {
        let failure = match self.run_stages(request, operation, run).await {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };

        run.record(failure.stage, false, failure.error.to_string());
        if failure.stage == PatchStage::PushAndResolve {
            if let Some(branch) = &run.outcome.branch {
                warn!(branch = %branch, "Push failed; branch kept for manual recovery");
                run.outcome
                    .warnings
                    .push(format!("branch '{branch}' kept locally; push it manually once the remote is reconciled"));
            }
        } else if run.branch_created {
            self.compensate(request, run).await;
        }
        Err(failure.error)
    }

    async fn run_stages(
        &self,
        request: &PatchRequest,
        operation: &dyn PatchOperation,
        run: &mut PatchRun,
    ) -> Result<(), StageFailure> {
        let git = self.tools.git.as_ref();
        let remote = self.config.repository.remote.as_str();

        let preflight = self.safety.preflight(request).await;
        let preflight_warnings = preflight.data().map(|p| p.warnings.clone()).unwrap_or_default();
        if let Err(error) = preflight.into_result() {
            return Err(StageFailure {
                stage: PatchStage::Preflight,
                error,
            });
        }
        run.outcome.warnings.extend(preflight_warnings);
        run.record(PatchStage::Preflight, true, "tools present, working tree acceptable");

        run.outcome.original_branch = git.current_branch().await.ok();
        let base = run.outcome.base_branch.clone();
        let name = unique_branch_name(git, remote, &self.config.patch.branch_prefix, Utc::now(), &request.description)
            .await
            .map_err(|e| StageFailure::at(PatchStage::BranchCreate)(e.into()))?;
        tracing::Span::current().record("branch", name.as_str());
        run.outcome.branch = Some(name.clone());

        if run.dry_run {
            run.simulate(PatchStage::BranchCreate, format!("would create '{name}' from '{base}'"));
        } else {
            git.create_branch(&name, &base)
                .await
                .map_err(|e| StageFailure::at(PatchStage::BranchCreate)(e.into()))?;
            run.branch_created = true;
            run.branch_start = git.head_commit().await.ok().filter(|h| !h.is_empty());
            run.record(PatchStage::BranchCreate, true, format!("created '{name}' from '{base}'"));
        }

        if run.dry_run {
            run.simulate(PatchStage::ApplyOperation, format!("would run: {}", operation.describe()));
        } else {
            operation
                .apply(&self.config.repository.root)
                .await
                .map_err(StageFailure::at(PatchStage::ApplyOperation))?;
            run.record(PatchStage::ApplyOperation, true, operation.describe());
        }

        let validation = self.validate(request, run).await.map_err(StageFailure::at(PatchStage::Validate))?;

        if run.dry_run {
            run.simulate(PatchStage::Commit, "would stage and commit changes");
        } else {
            let commit = self.commit(request).await.map_err(StageFailure::at(PatchStage::Commit))?;
            run.record(PatchStage::Commit, true, format!("committed {commit}"));
            run.outcome.commit = Some(commit);
        }

        let push_strategy = if run.dry_run {
            run.simulate(PatchStage::PushAndResolve, format!("would push '{name}' to '{remote}'"));
            "not pushed (dry run)".to_string()
        } else {
            let result = self.resolver.resolve_and_push(&name, remote).await;
            run.outcome.resolution = result.data.clone();
            let trace = result.into_result().map_err(StageFailure::at(PatchStage::PushAndResolve))?;
            run.pushed = true;
            let strategy = trace
                .succeeded_with
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            run.record(PatchStage::PushAndResolve, true, format!("pushed via {strategy}"));
            strategy
        };

        if request.flags.create_review {
            if run.dry_run {
                run.simulate(PatchStage::OpenReview, "would open a review request");
            } else {
                self.open_review(request, run, &name, validation, push_strategy)
                    .await
                    .map_err(StageFailure::at(PatchStage::OpenReview))?;
            }
        }

        Ok(())
    }

    async fn validate(&self, request: &PatchRequest, run: &mut PatchRun) -> Result<ValidationState, EngineError> {
        let command = match (&self.config.patch.validation_command, request.flags.skip_validation) {
            (_, true) => {
                run.record(PatchStage::Validate, true, "skipped on request");
                return Ok(ValidationState::Skipped);
            }
            (None, false) => {
                run.record(PatchStage::Validate, true, "no validation command configured");
                return Ok(ValidationState::NotConfigured);
            }
            (Some(command), false) => command,
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EngineError::configuration("patch.validation_command is empty"))?;

        if run.dry_run {
            run.simulate(PatchStage::Validate, format!("would run {}", command.join(" ")));
            return Ok(ValidationState::Passed);
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .tools
            .executor
            .execute(program, &args, &self.config.repository.root)
            .await?;
        if !output.success() {
            return Err(EngineError::validation(format!(
                "`{}` exited with {}: {}",
                command.join(" "),
                output.status_code,
                output.stderr.trim()
            )));
        }
        run.record(PatchStage::Validate, true, format!("`{}` passed", command.join(" ")));
        Ok(ValidationState::Passed)
    }

    async fn commit(&self, request: &PatchRequest) -> Result<CommitHash, EngineError> {
        let git = self.tools.git.as_ref();
        // Transient build output never reaches the commit
        git.add(&request.files, &self.config.rollback.transient_directories).await?;

        let status = git.status().await?;
        if !status.has_staged_changes() {
            return Err(EngineError::validation("operation produced no changes to commit"));
        }

        let message = format!("{} {}", self.config.patch.commit_prefix, request.description.trim());
        Ok(git.commit(&message).await?)
    }

    async fn open_review(
        &self,
        request: &PatchRequest,
        run: &mut PatchRun,
        branch: &str,
        validation: ValidationState,
        push_strategy: String,
    ) -> Result<(), EngineError> {
        let git = self.tools.git.as_ref();
        let review = self.tools.review.as_ref();
        let remote = self.config.repository.remote.as_str();

        // Already pushed by the resolver; a no-op unless something moved since
        git.push(remote, branch).await?;

        if run.outcome.linked_ticket.is_none() && request.flags.create_ticket {
            let labels = vec!["patchkeeper".to_string()];
            match review
                .create_ticket(&request.description, &format!("Tracking patch branch `{branch}`."), &labels)
                .await
            {
                Ok(ticket) => run.outcome.linked_ticket = Some(ticket),
                Err(e) => run.outcome.warnings.push(format!("could not create tracking ticket: {e}")),
            }
        }

        let body = ReviewBody {
            description: request.description.clone(),
            branch: branch.to_string(),
            base_branch: run.outcome.base_branch.clone(),
            commit: git.head_commit().await.unwrap_or_else(|_| "unknown".to_string()),
            origin_url: git.remote_url(remote).await.unwrap_or_else(|_| "unknown".to_string()),
            files: request.files.clone(),
            operation: run
                .outcome
                .stages
                .iter()
                .find(|s| s.stage == PatchStage::ApplyOperation)
                .map(|s| s.detail.clone())
                .unwrap_or_default(),
            push_strategy,
            validation,
            linked_ticket: run.outcome.linked_ticket,
            steps: workflow_steps(&run.outcome.stages),
            created_at: Utc::now(),
        };

        // A retried invocation may already have opened one for this branch
        let existing = review
            .list_reviews("open")
            .await
            .ok()
            .and_then(|reviews| reviews.into_iter().find(|r| r.head_branch == branch));
        let review_id = match existing {
            Some(summary) => {
                info!(review = summary.id, "Reusing open review for branch");
                summary.id
            }
            None => {
                review
                    .create_review(&ReviewRequestConfig {
                        title: body.title(),
                        body: body.render(),
                        head_branch: branch.to_string(),
                        base_branch: run.outcome.base_branch.clone(),
                    })
                    .await?
            }
        };
        run.outcome.review_id = Some(review_id);
        run.outcome.review_url = review.view_review(review_id).await.ok().map(|s| s.url);

        if request.flags.auto_merge {
            if let Err(e) = review.enable_auto_merge(review_id).await {
                warn!(review = review_id, error = %e, "Auto-merge request failed");
                run.outcome.warnings.push(format!("auto-merge not enabled: {e}"));
            }
        }

        run.record(PatchStage::OpenReview, true, format!("review #{review_id} opened"));
        Ok(())
    }

    /// Undo this attempt's branch; every step is best-effort
    async fn compensate(&self, request: &PatchRequest, run: &mut PatchRun) {
        let git = self.tools.git.as_ref();
        let Some(branch) = run.outcome.branch.clone() else {
            return;
        };
        let mut report = CompensationReport::default();
        warn!(branch = %branch, "Compensating failed patch attempt");

        if let Some(start) = run.branch_start.clone() {
            let params = RollbackParams {
                revision: Some(start),
                force: true,
                ..RollbackParams::default()
            };
            match self.rollback.rollback(RollbackTarget::SpecificRevision, params).await {
                Ok(result) => {
                    report.rollback_success = result.success;
                    report.rollback_message = Some(result.message.clone());
                    if !result.success {
                        report.errors.push(result.message);
                    }
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let return_to = run
            .outcome
            .original_branch
            .clone()
            .filter(|b| *b != branch)
            .or_else(|| request.base_branch.clone())
            .unwrap_or_else(|| self.config.repository.default_base_branch.clone());
        match git.checkout(&return_to).await {
            Ok(()) => report.checked_out = Some(return_to),
            Err(e) => report.errors.push(format!("checkout {return_to}: {}", e.stderr())),
        }

        match git.delete_branch(&branch, true).await {
            Ok(()) => report.branch_deleted = true,
            Err(e) => report.errors.push(format!("delete branch {branch}: {}", e.stderr())),
        }

        if run.pushed {
            match git.delete_remote_branch(&self.config.repository.remote, &branch).await {
                Ok(()) => report.remote_branch_deleted = true,
                Err(e) => report.errors.push(format!("delete remote branch {branch}: {}", e.stderr())),
            }
        }

        for e in &report.errors {
            error!(branch = %branch, error = %e, "Compensation step failed");
        }
        let success = report.errors.is_empty();
        run.record(
            PatchStage::Compensate,
            success,
            if success {
                format!("branch '{branch}' rolled back and removed")
            } else {
                format!("{} compensation step(s) failed", report.errors.len())
            },
        );
        run.outcome.compensation = Some(report);
    }

    fn start_monitor(&self, target: MonitorTarget) {
        let monitor = ReviewMonitor::new(self.config.clone(), self.tools.clone());
        let token = self.shutdown.child_token();
        let name = format!("review-monitor-{}", target.review_id);
        self.shutdown.spawn(name, async move {
            let report = monitor.run(target, token).await;
            info!(
                status = ?report.final_status(),
                ticket_closed = report.tickets.ticket_closed,
                "Review monitoring finished"
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{CommandOutput, GitClient, GitHubClient, ScriptedCommandExecutor};

    const MUTATING: [&str; 8] = [
        "git checkout",
        "git add",
        "git commit",
        "git push",
        "git reset",
        "git stash",
        "git branch -D",
        "gh pr create",
    ];

    fn base_script() -> ScriptedCommandExecutor {
        ScriptedCommandExecutor::permissive()
            .expect_command("git", &["branch", "--show-current"], CommandOutput::ok("main"))
            .expect_prefix("git show-ref --verify --quiet refs/", CommandOutput::failed(1, ""))
            .expect_command("gh", &["pr", "list", "--state", "open", "--json", "number,title,headRefName"], CommandOutput::ok("[]"))
            .expect_prefix("gh pr create", CommandOutput::ok("https://github.com/acme/site/pull/42"))
    }

    fn orchestrator(executor: ScriptedCommandExecutor) -> (PatchOrchestrator, Arc<ScriptedCommandExecutor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(executor);
        let config = Arc::new(EngineConfig::default().with_root(dir.path()));
        let tools = Toolchain::new(
            executor.clone(),
            Arc::new(GitClient::new(executor.clone(), "git", dir.path())),
            Arc::new(GitHubClient::new(executor.clone(), "gh", dir.path())),
        );
        (PatchOrchestrator::new(config, tools), executor, dir)
    }

    fn typo_request() -> PatchRequest {
        PatchRequest {
            files: vec!["readme.txt".to_string()],
            ..PatchRequest::new("fix: typo")
        }
    }

    #[tokio::test]
    async fn test_clean_run_opens_review() {
        let (orchestrator, executor, dir) = orchestrator(
            base_script()
                .expect_command("git", &["status", "--porcelain"], CommandOutput::ok(""))
                .expect_command("git", &["status", "--porcelain"], CommandOutput::ok("M  readme.txt"))
                .expect_command("git", &["rev-parse", "HEAD"], CommandOutput::ok("base000"))
                .expect_command("git", &["rev-parse", "HEAD"], CommandOutput::ok("abc1234")),
        );
        let operation = WriteFileOperation::new("readme.txt", "fixed\n");

        let result = orchestrator.execute(typo_request(), &operation).await;

        assert!(result.is_success(), "{}", result.message);
        let outcome = result.data().unwrap();
        let branch = outcome.branch.clone().unwrap();
        let today = Utc::now().format("%Y%m%d").to_string();
        assert!(branch.starts_with(&format!("patch/{today}-")));
        assert!(branch.ends_with("-fix-typo"));
        assert_eq!(outcome.commit.as_deref(), Some("abc1234"));
        assert_eq!(outcome.review_id, Some(42));
        assert_eq!(outcome.resolution.as_ref().unwrap().attempts.len(), 1);
        assert!(outcome.compensation.is_none());
        assert_eq!(executor.count_of("git commit -m patchkeeper: fix: typo"), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("readme.txt")).unwrap(), "fixed\n");

        let body_call = executor.calls().into_iter().find(|c| c.starts_with("gh pr create")).unwrap();
        assert!(body_call.contains("## Workflow Status"));
        assert!(body_call.contains("- [x] Sanitization applied"));
        assert!(body_call.contains("- [x] Pushed"));
        assert!(body_call.contains(&branch));
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing() {
        let (orchestrator, executor, dir) = orchestrator(base_script());
        let request = PatchRequest {
            flags: PatchFlags {
                dry_run: true,
                create_review: true,
                ..PatchFlags::default()
            },
            monitor: true,
            ..typo_request()
        };
        let operation = WriteFileOperation::new("readme.txt", "fixed\n");

        let result = orchestrator.execute(request, &operation).await;

        assert!(result.is_success());
        let outcome = result.data().unwrap();
        assert!(outcome.branch.is_some());
        assert!(outcome.commit.is_none());
        assert!(!outcome.monitor_started);
        assert!(outcome.stages.iter().filter(|s| s.simulated).count() >= 5);
        for call in executor.calls() {
            assert!(!MUTATING.iter().any(|m| call.starts_with(m)), "dry run issued {call}");
        }
        assert!(!dir.path().join("readme.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_operation_compensates() {
        let (orchestrator, executor, _dir) = orchestrator(
            base_script()
                .expect_command("git", &["rev-parse", "HEAD"], CommandOutput::ok("base000"))
                .expect_command("false", &[], CommandOutput::failed(1, "boom")),
        );
        let operation = CommandOperation::new(executor.clone(), "false", Vec::new());

        let result = orchestrator.execute(typo_request(), &operation).await;

        assert!(!result.is_success());
        assert_eq!(result.error.as_ref().unwrap().kind(), "ProcessError");
        let outcome = result.data().unwrap();
        let compensation = outcome.compensation.as_ref().unwrap();
        assert!(compensation.branch_deleted);
        assert!(!compensation.remote_branch_deleted);
        assert_eq!(compensation.checked_out.as_deref(), Some("main"));
        assert_eq!(executor.count_of("git reset --hard base000"), 1);
        assert!(executor.position_of("git reset --hard") < executor.position_of("git branch -D"));
        assert_eq!(executor.count_of("git push"), 0);
    }

    #[tokio::test]
    async fn test_push_failure_keeps_branch() {
        let (orchestrator, executor, _dir) = orchestrator(
            base_script()
                .expect_command("git", &["status", "--porcelain"], CommandOutput::ok(""))
                .expect_command("git", &["status", "--porcelain"], CommandOutput::ok("M  readme.txt"))
                .expect_prefix("git push", CommandOutput::failed(1, "! [rejected] (fetch first)"))
                .expect_prefix("git merge --no-ff", CommandOutput::failed(1, "CONFLICT (content)"))
                .expect_prefix("git rebase origin/", CommandOutput::failed(1, "CONFLICT (content)")),
        );
        let operation = WriteFileOperation::new("readme.txt", "fixed\n");

        let result = orchestrator.execute(typo_request(), &operation).await;

        assert!(!result.is_success());
        assert_eq!(result.error.as_ref().unwrap().kind(), "ConflictError");
        let outcome = result.data().unwrap();
        assert!(outcome.compensation.is_none());
        assert_eq!(outcome.resolution.as_ref().unwrap().attempts.len(), 4);
        assert_eq!(executor.count_of("git branch -D"), 0);
        assert_eq!(executor.count_of("gh pr create"), 0);
    }

    #[tokio::test]
    async fn test_nothing_to_commit_fails_and_compensates() {
        let (orchestrator, executor, _dir) = orchestrator(base_script());

        let result = orchestrator.execute(PatchRequest::new("noop"), &ExistingChanges).await;

        assert!(!result.is_success());
        assert_eq!(result.error.as_ref().unwrap().kind(), "ValidationError");
        assert!(result.data().unwrap().compensation.is_some());
        assert_eq!(executor.count_of("git commit"), 0);
    }

    #[tokio::test]
    async fn test_auto_merge_failure_is_only_a_warning() {
        let (orchestrator, _executor, _dir) = orchestrator(
            base_script()
                .expect_command("git", &["status", "--porcelain"], CommandOutput::ok(""))
                .expect_command("git", &["status", "--porcelain"], CommandOutput::ok("M  readme.txt"))
                .expect_prefix("gh pr merge", CommandOutput::failed(1, "auto-merge is not allowed for this repository")),
        );
        let mut request = typo_request();
        request.flags.auto_merge = true;

        let result = orchestrator.execute(request, &WriteFileOperation::new("readme.txt", "x")).await;

        assert!(result.is_success(), "{}", result.message);
        assert!(result.data().unwrap().warnings.iter().any(|w| w.contains("auto-merge")));
    }
}
