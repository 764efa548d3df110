//! Multi-strategy rollback of the working tree.
//!
//! Sequence per invocation: argument check, safety assessment, optional
//! backup, stash of uncommitted changes (forced runs only), the strategy
//! itself, optional post-rollback validation. A report is written whatever
//! the outcome.

pub mod backup;
pub mod report;
pub mod validation;

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::execution::{EngineError, ExecutionResult};
use crate::external::{CommitHash, ResetMode, Toolchain};
use crate::safety::{SafetyAssessment, SafetyGate};

pub use report::{FinishedRollbackLog, LoggedOperation, RollbackLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RollbackTarget {
    LastCommit,
    LastWorkingState,
    SpecificRevision,
    SelectiveFiles,
    Emergency,
}

impl RollbackTarget {
    pub fn slug(self) -> &'static str {
        match self {
            RollbackTarget::LastCommit => "last-commit",
            RollbackTarget::LastWorkingState => "last-working-state",
            RollbackTarget::SpecificRevision => "specific-revision",
            RollbackTarget::SelectiveFiles => "selective-files",
            RollbackTarget::Emergency => "emergency",
        }
    }
}

impl fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for RollbackTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "last-commit" | "lastcommit" => Ok(RollbackTarget::LastCommit),
            "last-working-state" | "lastworkingstate" => Ok(RollbackTarget::LastWorkingState),
            "specific-revision" | "specificrevision" | "revision" => Ok(RollbackTarget::SpecificRevision),
            "selective-files" | "selectivefiles" | "files" => Ok(RollbackTarget::SelectiveFiles),
            "emergency" => Ok(RollbackTarget::Emergency),
            other => Err(format!(
                "unknown rollback target '{other}' (expected last-commit, last-working-state, specific-revision, selective-files or emergency)"
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RollbackParams {
    pub revision: Option<String>,
    pub files: Vec<String>,
    pub create_backup: bool,
    pub force: bool,
    pub validate_after: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRestore {
    pub path: String,
    pub restored: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub target: RollbackTarget,
    pub safety: SafetyAssessment,
    /// Commit HEAD points at after the rollback
    pub reset_to: Option<CommitHash>,
    /// LastWorkingState found no validated commit and stepped back one commit
    pub used_fallback: bool,
    pub file_results: Vec<FileRestore>,
    pub affected_files: Vec<String>,
    pub backup_path: Option<PathBuf>,
    pub stashed: bool,
    pub stash_restored: bool,
    pub stash_restore_error: Option<String>,
    pub warnings: Vec<String>,
    pub report_path: Option<PathBuf>,
}

impl RollbackOutcome {
    fn new(target: RollbackTarget, safety: SafetyAssessment) -> Self {
        Self {
            target,
            warnings: safety.warnings.clone(),
            safety,
            reset_to: None,
            used_fallback: false,
            file_results: Vec::new(),
            affected_files: Vec::new(),
            backup_path: None,
            stashed: false,
            stash_restored: false,
            stash_restore_error: None,
            report_path: None,
        }
    }

    pub fn restored_files(&self) -> usize {
        self.file_results.iter().filter(|f| f.restored).count()
    }
}

pub struct RollbackEngine {
    config: Arc<EngineConfig>,
    tools: Toolchain,
    safety: SafetyGate,
}

impl RollbackEngine {
    pub fn new(config: Arc<EngineConfig>, tools: Toolchain) -> Self {
        let safety = SafetyGate::new(config.clone(), tools.clone());
        Self { config, tools, safety }
    }

    /// Roll the working tree back. Returns `Err` only for invalid arguments;
    /// every environmental failure comes back as a failed result.
    #[instrument(skip_all, fields(target = %target))]
    pub async fn rollback(
        &self,
        target: RollbackTarget,
        params: RollbackParams,
    ) -> Result<ExecutionResult<RollbackOutcome>, EngineError> {
        let revision = match target {
            RollbackTarget::SpecificRevision => Some(
                params
                    .revision
                    .as_deref()
                    .filter(|r| !r.trim().is_empty())
                    .ok_or_else(|| EngineError::invalid_argument("specific-revision rollback requires a revision"))?,
            ),
            _ => None,
        };
        if target == RollbackTarget::SelectiveFiles && params.files.is_empty() {
            return Err(EngineError::invalid_argument("selective-files rollback requires at least one file"));
        }

        let mut log = RollbackLog::start(target);
        let assessment = self.safety.rollback_safety(target, revision, &params.files).await;
        log.record(
            "safety check",
            assessment.safe,
            assessment.reason.clone().unwrap_or_else(|| "safe".to_string()),
        );
        let mut outcome = RollbackOutcome::new(target, assessment);

        if !outcome.safety.is_permitted(params.force) {
            let reason = outcome.safety.reason.clone().unwrap_or_default();
            let message = if outcome.safety.overridable {
                format!("Rollback blocked: {reason} (use force to override)")
            } else {
                format!("Rollback blocked: {reason}")
            };
            log.error(message.clone());
            self.seal(log, &mut outcome).await;
            return Ok(ExecutionResult::failed_with(message, EngineError::validation(reason), outcome));
        }
        if !outcome.safety.safe {
            outcome
                .warnings
                .push(format!("safety overridden by force: {}", outcome.safety.reason.clone().unwrap_or_default()));
        }

        if params.create_backup {
            match backup::create_backup(&self.config, self.tools.git.as_ref(), target).await {
                Ok(path) => {
                    log.record("backup", true, path.display().to_string());
                    outcome.backup_path = Some(path);
                }
                Err(e) => {
                    log.record("backup", false, e.to_string());
                    log.error(e.to_string());
                    self.seal(log, &mut outcome).await;
                    return Ok(ExecutionResult::failed_with("Backup failed; nothing was rolled back", e, outcome));
                }
            }
        }

        let head_before = self.tools.git.head_commit().await.ok();

        if params.force && target != RollbackTarget::SelectiveFiles {
            let dirty = self.tools.git.status().await.map(|s| !s.is_clean).unwrap_or(false);
            if dirty {
                let message = format!("{} pre-rollback stash ({target})", self.config.patch.commit_prefix);
                match self.tools.git.stash_push(&message).await {
                    Ok(stashed) => {
                        log.record("stash push", true, if stashed { "stashed" } else { "nothing to stash" });
                        outcome.stashed = stashed;
                    }
                    Err(e) => {
                        let err = EngineError::rollback(format!("could not stash uncommitted changes: {}", e.stderr()));
                        log.record("stash push", false, e.stderr());
                        log.error(err.to_string());
                        self.seal(log, &mut outcome).await;
                        return Ok(ExecutionResult::failed_with("Rollback aborted before any reset", err, outcome));
                    }
                }
            }
        }

        let applied = match target {
            RollbackTarget::LastCommit => self.reset(&mut log, ResetMode::Soft, "HEAD~1").await,
            RollbackTarget::LastWorkingState => self.last_working_state(&mut log, &mut outcome).await,
            RollbackTarget::SpecificRevision => {
                self.reset(&mut log, ResetMode::Hard, revision.unwrap_or("HEAD")).await
            }
            RollbackTarget::SelectiveFiles => self.selective_files(&mut log, &mut outcome, &params.files).await,
            RollbackTarget::Emergency => self.emergency(&mut log, &mut outcome).await,
        };

        if let Err(e) = applied {
            error!(error = %e, "Rollback failed");
            log.error(e.to_string());
            if outcome.stashed {
                self.restore_stash(&mut log, &mut outcome).await;
            }
            self.seal(log, &mut outcome).await;
            return Ok(ExecutionResult::failed_with(format!("Rollback ({target}) failed: {e}"), e, outcome));
        }

        // A soft reset keeps the commit's edits, so the stashed edits go back on
        // top; hard resets leave them in the stash for the operator.
        if outcome.stashed {
            if target == RollbackTarget::LastCommit {
                self.restore_stash(&mut log, &mut outcome).await;
            } else {
                outcome
                    .warnings
                    .push("uncommitted changes were kept in `git stash` (restore with `git stash pop`)".to_string());
            }
        }

        outcome.reset_to = self.tools.git.head_commit().await.ok();
        if target == RollbackTarget::SelectiveFiles {
            outcome.affected_files = outcome
                .file_results
                .iter()
                .filter(|f| f.restored)
                .map(|f| f.path.clone())
                .collect();
        } else if let (Some(before), Some(after)) = (&head_before, &outcome.reset_to) {
            outcome.affected_files = self.tools.git.changed_files(after, before).await.unwrap_or_default();
        }
        log.affected(outcome.affected_files.clone());

        if params.validate_after {
            let warnings = validation::validate_after_rollback(&self.config, self.tools.executor.as_ref()).await;
            log.record("post-rollback validation", warnings.is_empty(), format!("{} warning(s)", warnings.len()));
            outcome.warnings.extend(warnings);
        }

        let failed_files = outcome.file_results.len() - outcome.restored_files();
        if failed_files > 0 {
            let message = format!(
                "Restored {} of {} files; {failed_files} failed",
                outcome.restored_files(),
                outcome.file_results.len()
            );
            log.error(message.clone());
            self.seal(log, &mut outcome).await;
            return Ok(ExecutionResult::failed_with(message.clone(), EngineError::rollback(message), outcome));
        }

        self.seal(log, &mut outcome).await;
        info!(reset_to = ?outcome.reset_to, affected = outcome.affected_files.len(), "Rollback completed");
        Ok(ExecutionResult::ok(format!("Rollback ({target}) completed"), outcome))
    }

    /// Remove a backup the caller no longer needs
    pub async fn cleanup_backup(&self, path: &Path) -> ExecutionResult<PathBuf> {
        match backup::remove_backup(&self.config, path).await {
            Ok(()) => ExecutionResult::ok("Backup removed", path.to_path_buf()),
            Err(e) => ExecutionResult::failed(format!("Could not remove backup {}", path.display()), e),
        }
    }

    async fn reset(&self, log: &mut RollbackLog, mode: ResetMode, rev: &str) -> Result<(), EngineError> {
        let flag = match mode {
            ResetMode::Soft => "--soft",
            ResetMode::Hard => "--hard",
        };
        let operation = format!("reset {flag} {rev}");
        match self.tools.git.reset(mode, rev).await {
            Ok(()) => {
                log.record(operation, true, "ok");
                Ok(())
            }
            Err(e) => {
                log.record(operation, false, e.stderr());
                Err(EngineError::rollback(format!("git reset to {rev} failed: {}", e.stderr())))
            }
        }
    }

    async fn last_working_state(&self, log: &mut RollbackLog, outcome: &mut RollbackOutcome) -> Result<(), EngineError> {
        let marker = Regex::new(&self.config.rollback.validated_marker)
            .map_err(|e| EngineError::configuration(format!("invalid validated_marker: {e}")))?;
        let history = self
            .tools
            .git
            .log(self.config.rollback.history_window)
            .await
            .map_err(|e| EngineError::rollback(format!("cannot read history: {}", e.stderr())))?;

        match history.iter().find(|c| marker.is_match(&c.message)) {
            Some(commit) => {
                log.record("find validated commit", true, format!("{} {}", commit.id, commit.message));
                self.reset(log, ResetMode::Hard, &commit.id).await
            }
            None => {
                warn!(window = self.config.rollback.history_window, "No validated commit found; stepping back one commit");
                log.record("find validated commit", false, "none in window; falling back to HEAD~1");
                outcome.used_fallback = true;
                self.reset(log, ResetMode::Hard, "HEAD~1").await
            }
        }
    }

    async fn selective_files(
        &self,
        log: &mut RollbackLog,
        outcome: &mut RollbackOutcome,
        files: &[String],
    ) -> Result<(), EngineError> {
        for file in files {
            let result = self.tools.git.restore_file("HEAD", file).await;
            let restore = FileRestore {
                path: file.clone(),
                restored: result.is_ok(),
                error: result.err().map(|e| e.stderr()),
            };
            log.record(
                format!("restore {file}"),
                restore.restored,
                restore.error.clone().unwrap_or_else(|| "restored".to_string()),
            );
            outcome.file_results.push(restore);
        }
        Ok(())
    }

    async fn emergency(&self, log: &mut RollbackLog, outcome: &mut RollbackOutcome) -> Result<(), EngineError> {
        let history = self
            .tools
            .git
            .log(self.config.rollback.emergency_scan_depth)
            .await
            .map_err(|e| EngineError::rollback(format!("cannot read history: {}", e.stderr())))?;

        let prefix = &self.config.patch.commit_prefix;
        let target = match history.iter().find(|c| c.message.starts_with(prefix.as_str())) {
            Some(commit) => {
                log.record("find engine commit", true, format!("{} {}", commit.id, commit.message));
                commit.id.clone()
            }
            None => {
                let depth = self.config.rollback.emergency_fallback_depth;
                let fallback = history
                    .get(depth)
                    .or(history.last())
                    .map(|c| c.id.clone())
                    .ok_or_else(|| EngineError::rollback("repository has no commits to roll back to"))?;
                log.record("find engine commit", false, format!("none found; falling back {depth} commits"));
                outcome.used_fallback = true;
                fallback
            }
        };

        self.reset(log, ResetMode::Hard, &target).await?;

        match self.tools.git.clean_untracked().await {
            Ok(()) => log.record("clean untracked", true, "ok"),
            Err(e) => {
                log.record("clean untracked", false, e.stderr());
                outcome.warnings.push(format!("git clean failed: {}", e.stderr()));
            }
        }

        for dir in &self.config.rollback.transient_directories {
            let path = self.config.repository.root.join(dir);
            if !path.is_dir() {
                continue;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => log.record(format!("remove {dir}"), true, "ok"),
                Err(e) => {
                    log.record(format!("remove {dir}"), false, e.to_string());
                    outcome.warnings.push(format!("could not remove {dir}: {e}"));
                }
            }
        }
        Ok(())
    }

    async fn restore_stash(&self, log: &mut RollbackLog, outcome: &mut RollbackOutcome) {
        match self.tools.git.stash_pop().await {
            Ok(()) => {
                log.record("stash pop", true, "ok");
                outcome.stash_restored = true;
            }
            Err(e) => {
                // Reported alongside, never instead of, the rollback result
                let message = format!("stash restore failed: {}", e.stderr());
                warn!(%message);
                log.record("stash pop", false, e.stderr());
                log.error(message.clone());
                outcome.stash_restore_error = Some(message);
            }
        }
    }

    async fn seal(&self, log: RollbackLog, outcome: &mut RollbackOutcome) {
        let finished = log.finish();
        let dir = self.config.resolve(&self.config.rollback.report_dir);
        match finished.write(&dir).await {
            Ok(path) => outcome.report_path = Some(path),
            Err(e) => outcome.warnings.push(format!("could not write rollback report: {e}")),
        }
    }
}
