//! Pre-flight and pre-rollback checks.
//!
//! `preflight` gates a patch attempt; `rollback_safety` is advisory and
//! returns an assessment the caller may override with `force`, except for an
//! emergency rollback on a protected branch.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::execution::{EngineError, ExecutionResult};
use crate::external::{CommandError, Toolchain};
use crate::orchestrator::PatchRequest;
use crate::rollback::RollbackTarget;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCheck {
    pub program: String,
    pub version: Option<String>,
    pub installed_now: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub tools: Vec<ToolCheck>,
    pub current_branch: Option<String>,
    pub dirty: bool,
    pub warnings: Vec<String>,
}

/// Outcome of `rollback_safety`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyAssessment {
    pub safe: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
    /// False only for blocks that `force` must not bypass
    pub overridable: bool,
}

impl SafetyAssessment {
    fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
            warnings: Vec::new(),
            overridable: true,
        }
    }

    fn block(&mut self, reason: String, overridable: bool) {
        if self.safe {
            self.reason = Some(reason);
        } else if let Some(existing) = self.reason.as_mut() {
            existing.push_str("; ");
            existing.push_str(&reason);
        }
        self.safe = false;
        self.overridable &= overridable;
    }

    /// Whether the operation may proceed given the caller's `force` flag
    pub fn is_permitted(&self, force: bool) -> bool {
        self.safe || (force && self.overridable)
    }
}

pub struct SafetyGate {
    config: Arc<EngineConfig>,
    tools: Toolchain,
}

impl SafetyGate {
    pub fn new(config: Arc<EngineConfig>, tools: Toolchain) -> Self {
        Self { config, tools }
    }

    pub async fn preflight(&self, request: &PatchRequest) -> ExecutionResult<PreflightReport> {
        let mut programs = vec![self.config.tools.git.clone()];
        if request.flags.create_review {
            programs.push(self.config.tools.review.clone());
        }

        let mut tools = Vec::new();
        for program in programs {
            match self.ensure_tool(&program, request.flags.install_missing && !request.flags.dry_run).await {
                Ok(check) => tools.push(check),
                Err(error) => return ExecutionResult::failed(format!("Required tool '{program}' unavailable"), error),
            }
        }

        if request.flags.create_review {
            if let Err(e) = self.tools.review.auth_status().await {
                return ExecutionResult::failed("Review CLI is not usable", e.into());
            }
        }

        let status = match self.tools.git.status().await {
            Ok(status) => status,
            Err(e) => return ExecutionResult::failed("Could not read working tree status", e.into()),
        };

        let dirty = !status.is_clean;
        let mut warnings = Vec::new();
        if dirty {
            if !request.flags.force {
                return ExecutionResult::failed(
                    "Working tree has uncommitted changes",
                    EngineError::validation(format!(
                        "uncommitted changes present ({} staged, {} unstaged, {} untracked); commit them or use force",
                        status.staged_files.len(),
                        status.unstaged_files.len(),
                        status.untracked_files.len()
                    )),
                );
            }
            warnings.push("working tree has uncommitted changes; continuing because force is set".to_string());
        }

        info!(tools = tools.len(), dirty, "Preflight passed");
        ExecutionResult::ok(
            "Preflight checks passed",
            PreflightReport {
                tools,
                current_branch: status.current_branch,
                dirty,
                warnings,
            },
        )
    }

    async fn ensure_tool(&self, program: &str, install: bool) -> Result<ToolCheck, EngineError> {
        if let Some(version) = self.tool_version(program).await {
            return Ok(ToolCheck {
                program: program.to_string(),
                version: Some(version),
                installed_now: false,
            });
        }

        if !install {
            return Err(EngineError::validation(format!("'{program}' is not installed or not on PATH")));
        }

        let command = self.config.tools.install_commands.get(program).ok_or_else(|| {
            EngineError::validation(format!("'{program}' is missing and no install command is configured"))
        })?;
        let (installer, args) = command
            .split_first()
            .ok_or_else(|| EngineError::validation(format!("empty install command for '{program}'")))?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        warn!(program, installer = %installer, "Installing missing tool");
        let output = self
            .tools
            .executor
            .execute(installer, &args, &self.config.repository.root)
            .await
            .map_err(EngineError::from)?;
        if !output.success() {
            return Err(EngineError::Process {
                command: format!("{} {}", installer, args.join(" ")),
                exit_code: output.status_code,
                stderr: output.stderr,
            });
        }

        match self.tool_version(program).await {
            Some(version) => Ok(ToolCheck {
                program: program.to_string(),
                version: Some(version),
                installed_now: true,
            }),
            None => Err(EngineError::validation(format!("'{program}' still unavailable after installation"))),
        }
    }

    async fn tool_version(&self, program: &str) -> Option<String> {
        match self
            .tools
            .executor
            .execute(program, &["--version"], &self.config.repository.root)
            .await
        {
            Ok(output) if output.success() => Some(output.stdout.lines().next().unwrap_or("").trim().to_string()),
            Ok(_) | Err(CommandError::CommandNotFound { .. }) => None,
            Err(e) => {
                warn!(program, error = %e, "Tool version check failed");
                None
            }
        }
    }

    pub async fn rollback_safety(
        &self,
        target: RollbackTarget,
        revision: Option<&str>,
        files: &[String],
    ) -> SafetyAssessment {
        let mut assessment = SafetyAssessment::safe();

        match self.tools.git.current_branch().await {
            Ok(branch) if target == RollbackTarget::Emergency && self.config.is_protected_branch(&branch) => {
                assessment.block(
                    format!("emergency rollback is never allowed on protected branch '{branch}'"),
                    false,
                );
                return assessment;
            }
            Ok(_) => {}
            Err(e) if target == RollbackTarget::Emergency => {
                // An unknown branch may well be a protected one
                assessment.block(format!("cannot determine current branch: {}", e.stderr()), false);
                return assessment;
            }
            Err(e) => assessment.warnings.push(format!("cannot determine current branch: {}", e.stderr())),
        }

        if let Some(revision) = revision {
            match self.tools.git.commit_exists(revision).await {
                Ok(true) => {
                    if let Ok(time) = self.tools.git.commit_time(revision).await {
                        let age_days = (Utc::now() - time).num_days();
                        if age_days > self.config.safety.max_revision_age_days {
                            assessment.warnings.push(format!(
                                "revision {revision} is {age_days} days old (threshold {} days)",
                                self.config.safety.max_revision_age_days
                            ));
                        }
                    }
                }
                Ok(false) => assessment.block(format!("revision '{revision}' does not exist in history"), true),
                Err(e) => assessment.block(format!("cannot verify revision '{revision}': {}", e.stderr()), true),
            }
        }

        // Selective restores only touch the named files
        if target != RollbackTarget::SelectiveFiles {
            match self.tools.git.status().await {
                Ok(status) if !status.is_clean => {
                    assessment.block("working tree has uncommitted changes".to_string(), true);
                }
                Ok(_) => {}
                Err(e) => assessment.block(format!("cannot read working tree status: {}", e.stderr()), true),
            }
        }

        for file in files {
            if let Some(entry) = self.config.critical_overlap(file) {
                assessment
                    .warnings
                    .push(format!("'{file}' is a critical file (matches '{entry}')"));
            }
        }

        if !assessment.safe {
            warn!(?target, reason = ?assessment.reason, overridable = assessment.overridable, "Rollback judged unsafe");
        }
        assessment
    }
}
