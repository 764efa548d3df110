//! Suggested-edit extraction from review comments.
//!
//! Parsers are tried in order; the first one that recognises a comment wins.

use regex::Regex;
use std::path::{Component, Path};
use std::sync::LazyLock;

use crate::execution::EngineError;
use crate::external::ReviewComment;

static SUGGESTION_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```suggestion[^\n]*\n(.*?)```").expect("valid regex"));
static HUNK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@@ -\d+(?:,\d+)? \+(\d+)(?:,\d+)? @@").expect("valid regex"));
static LINE_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*lines?\s+(\d+)(?:\s*-\s*(\d+))?\s*:[ \t]*(.*)$").expect("valid regex"));
static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*file:\s*`?([^\s`]+)`?").expect("valid regex"));
static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("valid regex"));

/// A replacement of lines `start_line..=end_line` (1-based) in `path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub comment_id: u64,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub replacement: String,
}

pub trait SuggestionParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, comment: &ReviewComment) -> Option<Suggestion>;
}

/// ```` ```suggestion ```` block anchored by the diff context the review API reports
pub struct DiffHunkParser;

impl DiffHunkParser {
    /// Last new-file line covered by a hunk, used when the API omits `line`
    fn hunk_end_line(hunk: &str) -> Option<usize> {
        let mut lines = hunk.lines();
        let header = lines.next()?;
        let start: usize = HUNK_HEADER.captures(header)?.get(1)?.as_str().parse().ok()?;
        let new_side = lines.filter(|l| !l.starts_with('-')).count();
        Some(start + new_side.saturating_sub(1))
    }
}

impl SuggestionParser for DiffHunkParser {
    fn name(&self) -> &'static str {
        "diff-hunk"
    }

    fn parse(&self, comment: &ReviewComment) -> Option<Suggestion> {
        let replacement = SUGGESTION_BLOCK.captures(&comment.body)?.get(1)?.as_str();
        let path = comment.path.clone()?;
        let end_line = match comment.line {
            Some(line) => line as usize,
            None => Self::hunk_end_line(comment.diff_hunk.as_deref()?)?,
        };
        let start_line = comment.start_line.map(|l| l as usize).unwrap_or(end_line);
        if start_line == 0 || start_line > end_line {
            return None;
        }

        Some(Suggestion {
            comment_id: comment.id,
            path,
            start_line,
            end_line,
            replacement: replacement.to_string(),
        })
    }
}

/// Free-form `Line N: text` or `Lines N-M:` followed by a fenced block
pub struct LineReplacementParser;

impl SuggestionParser for LineReplacementParser {
    fn name(&self) -> &'static str {
        "line-replacement"
    }

    fn parse(&self, comment: &ReviewComment) -> Option<Suggestion> {
        let directive = LINE_DIRECTIVE.captures(&comment.body)?;
        let start_line: usize = directive.get(1)?.as_str().parse().ok()?;
        let end_line: usize = match directive.get(2) {
            Some(end) => end.as_str().parse().ok()?,
            None => start_line,
        };
        if start_line == 0 || start_line > end_line {
            return None;
        }

        let path = FILE_HEADER
            .captures(&comment.body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .or_else(|| comment.path.clone())?;

        let inline = directive.get(3).map(|m| m.as_str().trim_end()).unwrap_or("");
        let replacement = if inline.is_empty() {
            let rest = &comment.body[directive.get(0)?.end()..];
            FENCED_BLOCK.captures(rest)?.get(1)?.as_str().to_string()
        } else {
            format!("{inline}\n")
        };

        Some(Suggestion {
            comment_id: comment.id,
            path,
            start_line,
            end_line,
            replacement,
        })
    }
}

pub fn default_parsers() -> Vec<Box<dyn SuggestionParser>> {
    vec![Box::new(DiffHunkParser), Box::new(LineReplacementParser)]
}

/// Case-insensitive substring match against the configured bot patterns
pub fn is_bot(author: &str, patterns: &[String]) -> bool {
    let author = author.to_lowercase();
    patterns.iter().any(|p| author.contains(&p.to_lowercase()))
}

fn check_relative(path: &str) -> Result<(), EngineError> {
    let candidate = Path::new(path);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes || path.is_empty() {
        return Err(EngineError::invalid_argument(format!("suggestion path escapes repository: {path}")));
    }
    Ok(())
}

/// Apply a suggestion in place; returns the file's previous contents
pub async fn apply_suggestion(root: &Path, suggestion: &Suggestion) -> Result<String, EngineError> {
    check_relative(&suggestion.path)?;
    let file = root.join(&suggestion.path);
    let original = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| EngineError::validation(format!("cannot read {}: {e}", suggestion.path)))?;

    let lines: Vec<&str> = original.lines().collect();
    if suggestion.start_line == 0 || suggestion.start_line > suggestion.end_line || suggestion.end_line > lines.len() {
        return Err(EngineError::validation(format!(
            "{} has {} lines; suggestion targets {}-{}",
            suggestion.path,
            lines.len(),
            suggestion.start_line,
            suggestion.end_line
        )));
    }

    let mut updated: Vec<&str> = Vec::with_capacity(lines.len());
    updated.extend_from_slice(&lines[..suggestion.start_line - 1]);
    updated.extend(suggestion.replacement.lines());
    updated.extend_from_slice(&lines[suggestion.end_line..]);

    let mut contents = updated.join("\n");
    if original.ends_with('\n') && !contents.is_empty() {
        contents.push('\n');
    }

    tokio::fs::write(&file, contents)
        .await
        .map_err(|e| EngineError::validation(format!("cannot write {}: {e}", suggestion.path)))?;
    Ok(original)
}
