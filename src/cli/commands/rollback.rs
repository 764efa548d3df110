use anyhow::{anyhow, Result};
use std::sync::Arc;

use super::{report, Command, CommandContext};
use crate::lock::WorkingTreeLock;
use crate::rollback::{RollbackEngine, RollbackOutcome, RollbackParams, RollbackTarget};

pub struct RollbackCommand {
    pub target: RollbackTarget,
    pub params: RollbackParams,
}

impl RollbackCommand {
    pub fn parse(target: &str, params: RollbackParams) -> Result<Self> {
        let target = target.parse::<RollbackTarget>().map_err(|e| anyhow!(e))?;
        Ok(Self { target, params })
    }
}

impl Command for RollbackCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<bool> {
        if !ctx.json {
            println!("↩️  Rolling back: {}", self.target);
            println!();
        }

        let engine = RollbackEngine::new(Arc::clone(&ctx.config), ctx.tools.clone());
        let lock = WorkingTreeLock::for_root(&ctx.config.repository.root);
        let result = lock
            .run_exclusive(ctx.config.lock_timeout(), || engine.rollback(self.target, self.params.clone()))
            .await??;

        let fallback_depth = ctx.config.rollback.emergency_fallback_depth;
        report(ctx, &result, |outcome| print_outcome(outcome, fallback_depth))
    }
}

/// How far a rollback stepped back when it found no marker commit
fn fallback_note(target: RollbackTarget, fallback_depth: usize) -> String {
    match target {
        RollbackTarget::Emergency => {
            format!(" (no engine commit found; stepped back up to {fallback_depth} commits)")
        }
        _ => " (no validated commit found; stepped back one commit)".to_string(),
    }
}

fn print_outcome(outcome: &RollbackOutcome, fallback_depth: usize) {
    if let Some(reason) = &outcome.safety.reason {
        println!("   🛑 {reason}");
    }
    if let Some(commit) = &outcome.reset_to {
        let note = if outcome.used_fallback {
            fallback_note(outcome.target, fallback_depth)
        } else {
            String::new()
        };
        println!("   📍 HEAD now at {commit}{note}");
    }
    for file in &outcome.file_results {
        match &file.error {
            None => println!("   ✅ restored {}", file.path),
            Some(error) => println!("   ❌ {}: {error}", file.path),
        }
    }
    if !outcome.affected_files.is_empty() {
        println!("   📄 {} file(s) affected", outcome.affected_files.len());
    }
    if let Some(path) = &outcome.backup_path {
        println!("   💾 Backup: {}", path.display());
    }
    if outcome.stashed && !outcome.stash_restored {
        println!("   📦 Local changes kept in the stash (git stash list)");
    }
    for warning in &outcome.warnings {
        println!("   ⚠️  {warning}");
    }
    if let Some(path) = &outcome.report_path {
        println!("   🧾 Report: {}", path.display());
    }
}
