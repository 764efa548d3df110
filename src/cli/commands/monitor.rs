use anyhow::{Context, Result};
use std::sync::Arc;

use super::{Command, CommandContext};
use crate::monitor::{MonitorReport, MonitorTarget, ReviewMonitor, ReviewStatus};

pub struct MonitorCommand {
    pub review_id: u64,
    pub ticket: Option<u64>,
    pub branch: Option<String>,
}

impl MonitorCommand {
    async fn resolve_branch(&self, ctx: &CommandContext) -> Result<String> {
        if let Some(branch) = &self.branch {
            return Ok(branch.clone());
        }
        let snapshot = ctx
            .tools
            .review
            .view_review(self.review_id)
            .await
            .with_context(|| format!("Could not look up review #{}", self.review_id))?;
        Ok(snapshot.head_branch)
    }
}

impl Command for MonitorCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<bool> {
        let target = MonitorTarget {
            review_id: self.review_id,
            branch: self.resolve_branch(ctx).await?,
            linked_ticket: self.ticket,
        };

        if !ctx.json {
            println!("👀 Monitoring review #{} on {}; press Ctrl-C to stop", target.review_id, target.branch);
            println!();
        }

        ctx.shutdown.cancel_on_ctrl_c();
        let monitor = ReviewMonitor::new(Arc::clone(&ctx.config), ctx.tools.clone());
        let report = monitor.run(target, ctx.shutdown.child_token()).await;

        if ctx.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }

        Ok(matches!(report.final_status(), ReviewStatus::Merged | ReviewStatus::ClosedUnmerged))
    }
}

fn print_report(report: &MonitorReport) {
    let headline = match report.final_status() {
        ReviewStatus::Merged => "✅ Review merged",
        ReviewStatus::ClosedUnmerged => "🚫 Review closed without merge; ticket left open",
        ReviewStatus::TimedOut => "⏱️  Monitoring budget exhausted",
        ReviewStatus::Open | ReviewStatus::SuggestionsPending => "⏹️  Monitoring stopped",
    };
    println!("{headline}");
    println!("   🤖 {} suggestion(s) applied", report.suggestions.applied());
    for batch in &report.suggestions.batches {
        for failed in &batch.failed {
            println!("   ❌ comment {}: {}", failed.comment_id, failed.reason);
        }
    }
    if report.tickets.ticket_closed {
        if let Some(ticket) = report.tickets.ticket {
            println!("   🎫 Ticket #{ticket} closed");
        }
    }
    if report.tickets.branch_deleted {
        println!("   🧹 Patch branch deleted");
    }
    for error in &report.tickets.errors {
        println!("   ⚠️  {error}");
    }
}
