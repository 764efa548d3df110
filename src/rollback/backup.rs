//! Pre-rollback snapshots.
//!
//! A backup is a timestamped directory holding copies of the critical and
//! required files plus the `log`, `status` and `diff` output at the time of
//! the rollback. Backups live under the configured backup directory and are
//! removed only by an explicit [`remove_backup`] call.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::execution::EngineError;
use crate::external::GitRepository;

use super::RollbackTarget;

pub async fn create_backup(
    config: &EngineConfig,
    git: &dyn GitRepository,
    target: RollbackTarget,
) -> Result<PathBuf, EngineError> {
    let root = config.resolve(&config.rollback.backup_dir);
    let dir = root.join(format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S%3f"), target.slug()));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| EngineError::rollback(format!("cannot create backup directory {}: {e}", dir.display())))?;

    let files = config
        .safety
        .critical_files
        .iter()
        .chain(config.rollback.required_files.iter())
        .filter(|f| !f.ends_with('/'));
    for file in files {
        let source = config.repository.root.join(file);
        if !source.is_file() {
            continue;
        }
        let dest = dir.join("files").join(file);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::rollback(format!("backup of {file} failed: {e}")))?;
        }
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| EngineError::rollback(format!("backup of {file} failed: {e}")))?;
        debug!(file, "Backed up file");
    }

    let snapshots: [(&str, &[&str]); 3] = [
        ("git-log.txt", &["log", "--oneline", "--max-count=20"]),
        ("git-status.txt", &["status", "--porcelain"]),
        ("git-diff.patch", &["diff", "HEAD"]),
    ];
    for (name, args) in snapshots {
        // An empty repository has no HEAD to diff against
        let content = git.capture(args).await.unwrap_or_else(|e| format!("unavailable: {e}"));
        tokio::fs::write(dir.join(name), content)
            .await
            .map_err(|e| EngineError::rollback(format!("cannot write {name}: {e}")))?;
    }

    info!(path = %dir.display(), "Backup created");
    Ok(dir)
}

/// Remove a backup created by [`create_backup`]; paths outside the backup
/// directory are refused.
pub async fn remove_backup(config: &EngineConfig, path: &Path) -> Result<(), EngineError> {
    let root = config.resolve(&config.rollback.backup_dir);
    let root = root.canonicalize().unwrap_or(root);
    let target = path
        .canonicalize()
        .map_err(|e| EngineError::invalid_argument(format!("backup {} not found: {e}", path.display())))?;

    if !target.starts_with(&root) || target == root {
        return Err(EngineError::invalid_argument(format!(
            "{} is not a backup directory",
            path.display()
        )));
    }

    tokio::fs::remove_dir_all(&target)
        .await
        .map_err(|e| EngineError::rollback(format!("cannot remove backup {}: {e}", target.display())))?;
    info!(path = %target.display(), "Backup removed");
    Ok(())
}
