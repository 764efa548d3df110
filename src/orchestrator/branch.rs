//! Patch branch naming: `<prefix>/<YYYYMMDD-HHMMSS>-<slug>`.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

use crate::external::{GitError, GitRepository};

const MAX_SLUG_LEN: usize = 40;

/// Names handed out by this process per working tree; deleted branches leave
/// no ref behind, so this is what keeps their names from coming back
static ISSUED: LazyLock<Mutex<HashSet<(PathBuf, String)>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Lowercase ASCII alphanumerics separated by single dashes, at most 40 chars
pub fn slugify(description: &str) -> String {
    let mut slug = String::with_capacity(description.len());
    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "change".to_string()
    } else {
        slug.to_string()
    }
}

pub fn branch_name(prefix: &str, at: DateTime<Utc>, description: &str) -> String {
    format!("{}/{}-{}", prefix, at.format("%Y%m%d-%H%M%S"), slugify(description))
}

/// First free name, suffixing `-2`, `-3`, ... when the timestamped name is
/// taken locally, on `remote`, or was already issued in this process
pub async fn unique_branch_name(
    git: &dyn GitRepository,
    remote: &str,
    prefix: &str,
    at: DateTime<Utc>,
    description: &str,
) -> Result<String, GitError> {
    let base = branch_name(prefix, at, description);
    let root = git.root().to_path_buf();

    let mut n = 1;
    loop {
        let candidate = if n == 1 { base.clone() } else { format!("{base}-{n}") };
        n += 1;

        let key = (root.clone(), candidate.clone());
        if ISSUED.lock().unwrap_or_else(|e| e.into_inner()).contains(&key) {
            continue;
        }
        if git.branch_exists(&candidate).await? || git.remote_branch_exists(remote, &candidate).await? {
            continue;
        }

        // Another task may have claimed it while git was being asked
        if ISSUED.lock().unwrap_or_else(|e| e.into_inner()).insert(key) {
            return Ok(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{CommandOutput, GitClient, ScriptedCommandExecutor};
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("fix: typo"), "fix-typo");
        assert_eq!(slugify("  Update README.md -- again!! "), "update-readme-md-again");
        assert_eq!(slugify("!!!"), "change");
        assert_eq!(slugify("héllo wörld"), "h-llo-w-rld");
    }

    #[test]
    fn test_slug_truncation_does_not_leave_trailing_dash() {
        let slug = slugify("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa bbbb");
        assert_eq!(slug.len(), 39);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_branch_name_uses_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        assert_eq!(branch_name("patch", at, "fix: typo"), "patch/20261018-090507-fix-typo");
    }

    const BASE: &str = "patch/20261018-090507-fix-typo";

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap()
    }

    #[tokio::test]
    async fn test_unique_branch_name_suffixes_existing() {
        let executor = ScriptedCommandExecutor::new()
            .expect_command("git", &["show-ref", "--verify", "--quiet", &format!("refs/heads/{BASE}")], CommandOutput::ok(""))
            .expect_command(
                "git",
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{BASE}-2")],
                CommandOutput::failed(1, ""),
            )
            .expect_prefix("git show-ref --verify --quiet refs/remotes/", CommandOutput::failed(1, ""));
        let git = GitClient::new(Arc::new(executor), "git", "/repo/suffix-local");

        let name = unique_branch_name(&git, "origin", "patch", at(), "fix: typo").await.unwrap();

        assert_eq!(name, format!("{BASE}-2"));
    }

    #[tokio::test]
    async fn test_unique_branch_name_skips_remote_only_branch() {
        let executor = Arc::new(
            ScriptedCommandExecutor::new()
                .expect_prefix("git show-ref --verify --quiet refs/heads/", CommandOutput::failed(1, ""))
                .expect_command(
                    "git",
                    &["show-ref", "--verify", "--quiet", &format!("refs/remotes/origin/{BASE}")],
                    CommandOutput::ok(""),
                )
                .expect_prefix("git show-ref --verify --quiet refs/remotes/", CommandOutput::failed(1, "")),
        );
        let git = GitClient::new(executor.clone(), "git", "/repo/suffix-remote");

        let name = unique_branch_name(&git, "origin", "patch", at(), "fix: typo").await.unwrap();

        assert_eq!(name, format!("{BASE}-2"));
        assert_eq!(executor.count_of("git show-ref --verify --quiet refs/remotes/origin/"), 2);
    }

    #[tokio::test]
    async fn test_deleted_branch_name_is_not_reissued() {
        // nothing exists in git, as after compensation removed the branch
        let executor = ScriptedCommandExecutor::new()
            .expect_prefix("git show-ref --verify --quiet refs/", CommandOutput::failed(1, ""));
        let git = GitClient::new(Arc::new(executor), "git", "/repo/reissue");

        let first = unique_branch_name(&git, "origin", "patch", at(), "fix: typo").await.unwrap();
        let second = unique_branch_name(&git, "origin", "patch", at(), "fix: typo").await.unwrap();

        assert_eq!(first, BASE);
        assert_eq!(second, format!("{BASE}-2"));
    }
}
