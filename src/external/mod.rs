//! External tool abstractions
//!
//! This module provides trait-based abstractions for the external CLIs the
//! engine drives (git and the GitHub CLI), enabling testable code through
//! dependency injection and scripted implementations.

pub mod command;
pub mod git;
pub mod github;

use std::sync::Arc;

use crate::config::EngineConfig;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor, ScriptedCommandExecutor};
pub use git::{BranchName, CommitHash, CommitInfo, GitClient, GitError, GitRepository, GitStatus, ResetMode};
pub use github::{
    GitHubClient, RemoteReviewState, ReviewComment, ReviewError, ReviewId, ReviewOperations, ReviewRequestConfig,
    ReviewSnapshot, ReviewSummary, TicketId,
};

/// The set of external collaborators every component is built from
#[derive(Clone)]
pub struct Toolchain {
    pub executor: Arc<dyn CommandExecutor>,
    pub git: Arc<dyn GitRepository>,
    pub review: Arc<dyn ReviewOperations>,
}

impl Toolchain {
    /// Real git and gh clients rooted at the configured project root
    pub fn from_config(config: &EngineConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let root = config.repository.root.clone();
        let git = Arc::new(GitClient::new(executor.clone(), config.tools.git.clone(), root.clone()));
        let review = Arc::new(GitHubClient::new(executor.clone(), config.tools.review.clone(), root));
        Self { executor, git, review }
    }

    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        git: Arc<dyn GitRepository>,
        review: Arc<dyn ReviewOperations>,
    ) -> Self {
        Self { executor, git, review }
    }
}
