//! Append-only record of one rollback invocation and its Markdown report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::RollbackTarget;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggedOperation {
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub result: String,
}

/// In-progress log; only grows until [`RollbackLog::finish`] seals it
#[derive(Debug)]
pub struct RollbackLog {
    target: RollbackTarget,
    started_at: DateTime<Utc>,
    operations: Vec<LoggedOperation>,
    errors: Vec<String>,
    affected_files: Vec<String>,
}

impl RollbackLog {
    pub fn start(target: RollbackTarget) -> Self {
        Self {
            target,
            started_at: Utc::now(),
            operations: Vec::new(),
            errors: Vec::new(),
            affected_files: Vec::new(),
        }
    }

    pub fn record(&mut self, operation: impl Into<String>, success: bool, result: impl Into<String>) {
        self.operations.push(LoggedOperation {
            operation: operation.into(),
            timestamp: Utc::now(),
            success,
            result: result.into(),
        });
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn affected(&mut self, files: impl IntoIterator<Item = String>) {
        self.affected_files.extend(files);
    }

    pub fn finish(self) -> FinishedRollbackLog {
        FinishedRollbackLog {
            target: self.target,
            started_at: self.started_at,
            ended_at: Utc::now(),
            operations: self.operations,
            errors: self.errors,
            affected_files: self.affected_files,
        }
    }
}

/// Sealed log; no mutators
#[derive(Debug, Clone, Serialize)]
pub struct FinishedRollbackLog {
    target: RollbackTarget,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    operations: Vec<LoggedOperation>,
    errors: Vec<String>,
    affected_files: Vec<String>,
}

impl FinishedRollbackLog {
    pub fn target(&self) -> RollbackTarget {
        self.target
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn operations(&self) -> &[LoggedOperation] {
        &self.operations
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn affected_files(&self) -> &[String] {
        &self.affected_files
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    pub fn to_markdown(&self, host: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Rollback Report\n");
        let _ = writeln!(out, "| Field | Value |");
        let _ = writeln!(out, "|---|---|");
        let _ = writeln!(out, "| Target | {} |", self.target);
        let _ = writeln!(out, "| Host | {host} |");
        let _ = writeln!(out, "| Started | {} |", self.started_at.to_rfc3339());
        let _ = writeln!(out, "| Ended | {} |", self.ended_at.to_rfc3339());
        let _ = writeln!(out, "| Duration | {} ms |", self.duration().num_milliseconds());
        let _ = writeln!(out, "| Outcome | {} |", if self.errors.is_empty() { "success" } else { "failed" });

        let _ = writeln!(out, "\n## Operations\n");
        for op in &self.operations {
            let mark = if op.success { "x" } else { " " };
            let _ = writeln!(out, "- [{mark}] `{}` {} ({})", op.operation, op.result, op.timestamp.to_rfc3339());
        }

        let _ = writeln!(out, "\n## Affected Files\n");
        if self.affected_files.is_empty() {
            let _ = writeln!(out, "_none_");
        }
        for file in &self.affected_files {
            let _ = writeln!(out, "- `{file}`");
        }

        let _ = writeln!(out, "\n## Errors\n");
        if self.errors.is_empty() {
            let _ = writeln!(out, "_none_");
        }
        for error in &self.errors {
            let _ = writeln!(out, "- {error}");
        }
        out
    }

    /// Write `rollback-<timestamp>-<target>.md` into `dir`
    pub async fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let path = dir.join(format!(
            "rollback-{}-{}.md",
            self.started_at.format("%Y%m%d-%H%M%S%3f"),
            self.target.slug()
        ));
        tokio::fs::write(&path, self.to_markdown(&host)).await?;
        Ok(path)
    }
}
