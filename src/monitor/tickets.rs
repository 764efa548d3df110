//! Merge-status loop: resolves the linked ticket and cleans up the branch.

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::{ReviewEvent, ReviewTracker};
use super::{MonitorTarget, ReviewMonitor};
use crate::external::{RemoteReviewState, TicketId};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TicketReport {
    pub ticket: Option<TicketId>,
    pub polls: usize,
    pub poll_errors: usize,
    pub ticket_closed: bool,
    pub branch_deleted: bool,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl ReviewMonitor {
    pub(super) async fn watch_status(
        &self,
        target: &MonitorTarget,
        tracker: &Mutex<ReviewTracker>,
        cancel: &CancellationToken,
    ) -> TicketReport {
        let deadline = Instant::now() + self.config.ticket_budget();
        let mut report = TicketReport {
            ticket: target.linked_ticket,
            ..TicketReport::default()
        };

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if Instant::now() >= deadline {
                tracker.lock().await.handle(ReviewEvent::BudgetExhausted);
                break;
            }

            // Closure decisions only ever follow a poll made in this iteration
            match self.tools.review.view_review(target.review_id).await {
                Ok(snapshot) => {
                    report.polls += 1;
                    match snapshot.state {
                        RemoteReviewState::Merged => {
                            let close_ticket = {
                                let mut tracker = tracker.lock().await;
                                tracker.handle(ReviewEvent::Merged);
                                tracker.ticket_close_requested()
                            };
                            self.on_merged(target, close_ticket, &mut report).await;
                            break;
                        }
                        RemoteReviewState::Closed => {
                            tracker.lock().await.handle(ReviewEvent::ClosedUnmerged);
                            break;
                        }
                        RemoteReviewState::Open => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Review status poll failed; retrying next interval");
                    report.poll_errors += 1;
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

    async fn on_merged(&self, target: &MonitorTarget, close_ticket: bool, report: &mut TicketReport) {
        if let (true, Some(ticket)) = (close_ticket, target.linked_ticket) {
            let note = format!("Resolved by merged review #{}.", target.review_id);
            if let Err(e) = self.tools.review.comment_ticket(ticket, &note).await {
                warn!(ticket, error = %e, "Could not comment on ticket");
                report.errors.push(e.to_string());
            }
            match self.tools.review.close_ticket(ticket).await {
                Ok(()) => {
                    info!(ticket, "Linked ticket closed");
                    report.ticket_closed = true;
                }
                Err(e) => {
                    warn!(ticket, error = %e, "Could not close ticket");
                    report.errors.push(e.to_string());
                }
            }
        }

        if self.config.monitor.delete_branch_on_merge {
            let cleanup = self
                .lock
                .run_exclusive(self.config.lock_timeout(), || self.delete_merged_branch(&target.branch))
                .await;
            match cleanup {
                Ok(errors) => {
                    report.branch_deleted = errors.is_empty();
                    report.errors.extend(errors);
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }
    }

    /// Best-effort local and remote deletion; returns the failures
    async fn delete_merged_branch(&self, branch: &str) -> Vec<String> {
        let git = &self.tools.git;
        let mut errors = Vec::new();

        if git.current_branch().await.ok().as_deref() == Some(branch) {
            if let Err(e) = git.checkout(&self.config.repository.default_base_branch).await {
                errors.push(e.to_string());
                return errors;
            }
        }
        if let Err(e) = git.delete_branch(branch, true).await {
            errors.push(e.to_string());
        }
        if let Err(e) = git.delete_remote_branch(&self.config.repository.remote, branch).await {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            info!(branch, "Merged patch branch deleted");
        }
        errors
    }
}
