use anyhow::Result;
use std::sync::Arc;

use super::{report, Command, CommandContext};
use crate::orchestrator::{
    CommandOperation, ExistingChanges, PatchFlags, PatchOperation, PatchOrchestrator, PatchOutcome, PatchRequest,
};

pub struct PatchCommand {
    pub request: PatchRequest,
    /// Program and arguments run as the change; empty commits existing changes
    pub command: Vec<String>,
}

impl PatchCommand {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            request: PatchRequest::new(description),
            command: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.request.files = files;
        self
    }

    pub fn with_base(mut self, base: Option<String>) -> Self {
        self.request.base_branch = base;
        self
    }

    pub fn with_flags(mut self, flags: PatchFlags) -> Self {
        self.request.flags = flags;
        self
    }

    pub fn with_ticket(mut self, ticket: Option<u64>) -> Self {
        self.request.linked_ticket = ticket;
        self
    }

    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.request.monitor = monitor;
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    fn operation(&self, ctx: &CommandContext) -> Box<dyn PatchOperation> {
        match self.command.split_first() {
            Some((program, args)) => Box::new(CommandOperation::new(ctx.tools.executor.clone(), program.clone(), args.to_vec())),
            None => Box::new(ExistingChanges),
        }
    }
}

impl Command for PatchCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<bool> {
        let orchestrator =
            PatchOrchestrator::new(Arc::clone(&ctx.config), ctx.tools.clone()).with_shutdown(ctx.shutdown.clone());
        let operation = self.operation(ctx);

        if !ctx.json {
            let mode = if self.request.flags.dry_run { " (dry run)" } else { "" };
            println!("🩹 Patching: {}{mode}", self.request.description.lines().next().unwrap_or(""));
            println!();
        }

        let result = orchestrator.execute(self.request.clone(), operation.as_ref()).await;
        let success = report(ctx, &result, print_outcome)?;

        let monitoring = result.data().map(|o| o.monitor_started).unwrap_or(false);
        if monitoring {
            if !ctx.json {
                println!();
                println!("👀 Monitoring the review; press Ctrl-C to stop");
            }
            ctx.shutdown.cancel_on_ctrl_c();
            ctx.shutdown.wait().await;
        }

        Ok(success)
    }
}

fn print_outcome(outcome: &PatchOutcome) {
    for stage in &outcome.stages {
        let marker = match (stage.success, stage.simulated) {
            (true, true) => "📝",
            (true, false) => "✅",
            (false, _) => "❌",
        };
        println!("   {marker} {:?}: {}", stage.stage, stage.detail);
    }
    if let Some(branch) = &outcome.branch {
        println!("   🌿 Branch: {branch}");
    }
    if let Some(trace) = &outcome.resolution {
        println!("   🔀 Push attempts:");
        for line in trace.render().lines() {
            println!("      {line}");
        }
    }
    if let Some(url) = &outcome.review_url {
        println!("   🔗 Review: {url}");
    }
    if let Some(compensation) = &outcome.compensation {
        let state = if compensation.errors.is_empty() { "clean" } else { "incomplete" };
        println!("   ↩️  Compensation {state}");
        for error in &compensation.errors {
            println!("      ⚠️  {error}");
        }
    }
    for warning in &outcome.warnings {
        println!("   ⚠️  {warning}");
    }
}
